// file: src/platform/linux.rs
// version: 1.1.0
// guid: 6a1d7c24-3f5e-4b8a-9e07-d2c4f81a0b95

//! Native Linux strategy: lsblk/sysfs enumeration, dd, sgdisk, mkfs.fat and mount

use super::command::{argv, CommandRunner};
use super::{
    HostKind, HostPlatform, MountPoint, PartitionHandle, RejectReason, Subphase, TargetDevice,
};
use crate::config::Timeouts;
use crate::error::ProvisionError;
use crate::utils::{FileLock, SystemUtils};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const LSBLK_COLUMNS: &str = "NAME,PATH,SIZE,TYPE,RM,HOTPLUG,TRAN,MODEL,SERIAL,MOUNTPOINT";

/// Mount targets that mark a disk as the running system's
pub const SYSTEM_MOUNTS: &[&str] = &["/", "/boot", "/boot/efi", "/efi", "/usr", "/var", "[SWAP]"];

/// Kernel names that are never physical disks
const VIRTUAL_PREFIXES: &[&str] = &["loop", "ram", "zram", "sr", "dm-", "md", "nbd", "fd"];

/// Tools without a fallback; lsblk falls back to sysfs
pub const REQUIRED_TOOLS: &[&str] = &["dd", "sgdisk", "partprobe", "mkfs.fat", "mount", "umount"];

const PARTITION_POLL_ATTEMPTS: u32 = 10;
const PARTITION_POLL_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

/// One lsblk record. Older util-linux releases print every column as a
/// string, newer ones use JSON booleans and numbers.
#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default, deserialize_with = "flex_u64")]
    size: Option<u64>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default, deserialize_with = "flex_bool")]
    rm: bool,
    #[serde(default, deserialize_with = "flex_bool")]
    hotplug: bool,
    #[serde(default)]
    tran: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    serial: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Flex {
    Bool(bool),
    Num(u64),
    Str(String),
}

fn flex_bool<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    Ok(match Option::<Flex>::deserialize(d)? {
        Some(Flex::Bool(b)) => b,
        Some(Flex::Num(n)) => n != 0,
        Some(Flex::Str(s)) => matches!(s.trim(), "1" | "true"),
        None => false,
    })
}

fn flex_u64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u64>, D::Error> {
    Ok(match Option::<Flex>::deserialize(d)? {
        Some(Flex::Num(n)) => Some(n),
        Some(Flex::Str(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

impl LsblkDevice {
    fn is_disk(&self) -> bool {
        self.kind.as_deref() == Some("disk")
            && !VIRTUAL_PREFIXES.iter().any(|p| self.name.starts_with(p))
    }

    fn node(&self) -> PathBuf {
        self.path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("/dev/{}", self.name)))
    }

    /// Mount targets on this device and every partition below it
    fn mountpoints(&self) -> Vec<String> {
        let mut out: Vec<String> = self.mountpoint.iter().cloned().collect();
        for child in &self.children {
            out.extend(child.mountpoints());
        }
        out
    }

    fn to_target(&self) -> TargetDevice {
        let trim = |s: &Option<String>| s.as_deref().unwrap_or("").trim().to_string();
        TargetDevice {
            platform_id: self.name.clone(),
            path: self.node(),
            size_bytes: self.size.unwrap_or(0),
            model: trim(&self.model),
            serial: trim(&self.serial),
            removable: self.rm || self.hotplug || self.tran.as_deref() == Some("usb"),
            is_system_or_boot: self
                .mountpoints()
                .iter()
                .any(|m| SYSTEM_MOUNTS.contains(&m.as_str())),
        }
    }
}

fn parse_lsblk(json: &str, subphase: Subphase) -> Result<Vec<LsblkDevice>> {
    serde_json::from_str::<LsblkOutput>(json)
        .map(|o| o.blockdevices)
        .map_err(|e| ProvisionError::platform(subphase, format!("unparseable lsblk output: {}", e)))
}

/// Trailing partition number of a kernel name (`sdb2`, `nvme0n1p2`, `mmcblk0p1`)
fn partition_number(name: &str) -> Option<u32> {
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

/// `(source, target)` pairs from `/proc/mounts`
fn parse_proc_mounts(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some((fields.next()?.to_string(), fields.next()?.to_string()))
        })
        .collect()
}

/// True when `source` is `/dev/<disk>` or one of its partitions
fn source_on_disk(source: &str, disk: &str) -> bool {
    let Some(rest) = source.strip_prefix("/dev/").and_then(|s| s.strip_prefix(disk)) else {
        return false;
    };
    let rest = rest.strip_prefix('p').unwrap_or(rest);
    rest.chars().all(|c| c.is_ascii_digit())
}

/// Enumerate whole disks from sysfs when lsblk is unavailable
pub(crate) fn read_sysfs_devices(block_dir: &Path, proc_mounts: &str) -> Result<Vec<TargetDevice>> {
    let mounts = parse_proc_mounts(proc_mounts);
    let read = |p: PathBuf| std::fs::read_to_string(p).map(|s| s.trim().to_string()).unwrap_or_default();

    let mut devices = Vec::new();
    for entry in std::fs::read_dir(block_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }

        let dir = entry.path();
        let sectors: u64 = read(dir.join("size")).parse().unwrap_or(0);
        let on_usb = std::fs::canonicalize(&dir)
            .map(|p| p.to_string_lossy().contains("/usb"))
            .unwrap_or(false);

        devices.push(TargetDevice {
            platform_id: name.clone(),
            path: PathBuf::from(format!("/dev/{}", name)),
            size_bytes: sectors * 512,
            model: read(dir.join("device").join("model")),
            serial: read(dir.join("device").join("serial")),
            removable: read(dir.join("removable")) == "1" || on_usb,
            is_system_or_boot: mounts
                .iter()
                .any(|(src, tgt)| source_on_disk(src, &name) && SYSTEM_MOUNTS.contains(&tgt.as_str())),
        });
    }
    devices.sort_by(|a, b| a.platform_id.cmp(&b.platform_id));
    Ok(devices)
}

/// Linux host strategy
pub struct LinuxPlatform {
    runner: Arc<dyn CommandRunner>,
    timeouts: Timeouts,
    sysfs_block: PathBuf,
    proc_mounts: PathBuf,
    locks: Mutex<HashMap<PathBuf, FileLock>>,
}

impl LinuxPlatform {
    pub fn new(runner: Arc<dyn CommandRunner>, timeouts: Timeouts) -> Self {
        Self {
            runner,
            timeouts,
            sysfs_block: PathBuf::from("/sys/block"),
            proc_mounts: PathBuf::from("/proc/mounts"),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Read sysfs and the mount table from alternate roots
    pub fn with_sysfs(mut self, block_dir: impl Into<PathBuf>, proc_mounts: impl Into<PathBuf>) -> Self {
        self.sysfs_block = block_dir.into();
        self.proc_mounts = proc_mounts.into();
        self
    }

    async fn lsblk(&self, device: Option<&Path>, subphase: Subphase) -> Result<Vec<LsblkDevice>> {
        let mut args = argv(&["-J", "-b", "-o", LSBLK_COLUMNS]);
        if let Some(device) = device {
            args.push(device.display().to_string());
        }
        let stdout = self
            .runner
            .run_checked(subphase, "lsblk", &args, self.timeouts.enumerate())
            .await?;
        parse_lsblk(&stdout, subphase)
    }

    async fn device_mountpoints(&self, device: &Path, subphase: Subphase) -> Result<Vec<String>> {
        Ok(self
            .lsblk(Some(device), subphase)
            .await?
            .iter()
            .flat_map(LsblkDevice::mountpoints)
            .collect())
    }

    /// Kernel names of the whole disks currently present
    pub async fn disk_names(&self, subphase: Subphase) -> Result<Vec<String>> {
        Ok(self
            .lsblk(None, subphase)
            .await?
            .into_iter()
            .filter(LsblkDevice::is_disk)
            .map(|d| d.name)
            .collect())
    }

    async fn partitions(&self, device: &Path) -> Result<Vec<(u32, PathBuf)>> {
        let devices = self.lsblk(Some(device), Subphase::Partition).await?;
        Ok(devices
            .iter()
            .flat_map(|d| d.children.iter())
            .filter(|c| c.kind.as_deref() == Some("part"))
            .filter_map(|c| partition_number(&c.name).map(|n| (n, c.node())))
            .collect())
    }

    async fn sgdisk(&self, device: &Path, args: &[&str]) -> Result<()> {
        let mut full = argv(args);
        full.push(device.display().to_string());
        self.runner
            .run_checked(Subphase::Partition, "sgdisk", &full, self.timeouts.device_op())
            .await?;
        Ok(())
    }

    async fn reread_partitions(&self, device: &Path) -> Result<()> {
        self.runner
            .run_checked(
                Subphase::Partition,
                "partprobe",
                &[device.display().to_string()],
                self.timeouts.device_op(),
            )
            .await?;
        Ok(())
    }

    async fn lock_device(&self, path: &Path) -> Result<()> {
        let node = path.to_path_buf();
        let task = tokio::task::spawn_blocking(move || -> Result<FileLock> {
            let file = std::fs::File::open(&node)?;
            FileLock::from_file(&node, file)
        });
        let lock = tokio::time::timeout(self.timeouts.device_op(), task)
            .await
            .map_err(|_| ProvisionError::Timeout {
                subphase: Subphase::Offline,
                secs: self.timeouts.device_op_secs,
            })?
            .map_err(|e| ProvisionError::platform(Subphase::Offline, e.to_string()))?
            .map_err(|e| {
                ProvisionError::platform(
                    Subphase::Offline,
                    format!("cannot lock {}: {}", path.display(), e),
                )
            })?;

        self.locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(path.to_path_buf(), lock);
        Ok(())
    }

    fn unlock_device(&self, path: &Path) -> bool {
        self.locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(path)
            .is_some()
    }
}

#[async_trait]
impl HostPlatform for LinuxPlatform {
    fn kind(&self) -> HostKind {
        HostKind::Linux
    }

    fn missing_tools(&self) -> Vec<String> {
        SystemUtils::missing_commands(REQUIRED_TOOLS)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    async fn list_block_devices(&self) -> Result<Vec<TargetDevice>> {
        match self.lsblk(None, Subphase::Enumerate).await {
            Ok(devices) => Ok(devices
                .iter()
                .filter(|d| d.is_disk())
                .map(LsblkDevice::to_target)
                .collect()),
            Err(e) => {
                warn!("lsblk unavailable ({}), reading {}", e, self.sysfs_block.display());
                let mounts = tokio::fs::read_to_string(&self.proc_mounts)
                    .await
                    .unwrap_or_default();
                read_sysfs_devices(&self.sysfs_block, &mounts).map_err(|io| {
                    ProvisionError::platform(
                        Subphase::Enumerate,
                        format!("lsblk failed ({}) and sysfs is unreadable: {}", e, io),
                    )
                })
            }
        }
    }

    async fn blocking_mounts(&self, device: &TargetDevice) -> Result<Vec<RejectReason>> {
        Ok(self
            .device_mountpoints(&device.path, Subphase::Enumerate)
            .await?
            .into_iter()
            .filter(|m| SYSTEM_MOUNTS.contains(&m.as_str()))
            .map(RejectReason::SystemMount)
            .collect())
    }

    async fn offline(&self, device: &TargetDevice) -> Result<()> {
        let mut mounts = self.device_mountpoints(&device.path, Subphase::Offline).await?;
        // Deepest first so nested mounts come off before their parents
        mounts.sort_by_key(|m| std::cmp::Reverse(m.len()));
        for mount in mounts {
            info!("Unmounting {} from {}", mount, device.path.display());
            self.runner
                .run_checked(Subphase::Offline, "umount", &[mount], self.timeouts.device_op())
                .await?;
        }

        self.lock_device(&device.path).await?;
        debug!("Holding exclusive lock on {}", device.path.display());
        Ok(())
    }

    async fn online(&self, device: &TargetDevice) -> Result<()> {
        if self.unlock_device(&device.path) {
            debug!("Released lock on {}", device.path.display());
        }
        Ok(())
    }

    async fn raw_write(&self, image: &Path, device: &TargetDevice) -> Result<()> {
        if device.is_system_or_boot {
            return Err(ProvisionError::DeviceRejected {
                device: device.path.display().to_string(),
                reason: RejectReason::SystemPartition,
            });
        }

        info!("Writing {} to {}", image.display(), device.path.display());
        let args = vec![
            format!("if={}", image.display()),
            format!("of={}", device.path.display()),
            "bs=4M".to_string(),
            "conv=fsync".to_string(),
            "oflag=direct".to_string(),
            "status=none".to_string(),
        ];
        self.runner
            .run_checked(Subphase::Write, "dd", &args, self.timeouts.raw_write())
            .await?;
        self.runner
            .run_checked(Subphase::Write, "sync", &[], self.timeouts.device_op())
            .await?;
        Ok(())
    }

    async fn reset_partition_table(&self, device: &TargetDevice) -> Result<()> {
        self.sgdisk(&device.path, &["--zap-all"]).await?;
        self.sgdisk(&device.path, &["--clear"]).await?;
        self.reread_partitions(&device.path).await
    }

    async fn append_partition(
        &self,
        device: &TargetDevice,
        name: &str,
        size_mib: Option<u64>,
    ) -> Result<PartitionHandle> {
        let before = self.partitions(&device.path).await?;

        // The image's backup GPT sits at the end of the image, not the device
        self.sgdisk(&device.path, &["--move-second-header"]).await?;
        let extent = match size_mib {
            Some(mib) => format!("0:0:+{}M", mib),
            None => "0:0:0".to_string(),
        };
        let label = format!("0:{}", name);
        self.sgdisk(
            &device.path,
            &["--new", &extent, "--typecode", "0:0700", "--change-name", &label],
        )
        .await?;
        self.reread_partitions(&device.path).await?;

        for attempt in 0..PARTITION_POLL_ATTEMPTS {
            let after = self.partitions(&device.path).await?;
            let fresh = after
                .iter()
                .filter(|p| !before.contains(p))
                .max_by_key(|(n, _)| *n);
            if let Some((number, node)) = fresh {
                debug!("New partition {} after {} polls", node.display(), attempt + 1);
                return Ok(PartitionHandle {
                    device: device.path.clone(),
                    node: node.clone(),
                    number: *number,
                    name: name.to_string(),
                });
            }
            tokio::time::sleep(PARTITION_POLL_INTERVAL).await;
        }

        Err(ProvisionError::platform(
            Subphase::Partition,
            format!("no new partition appeared on {}", device.path.display()),
        ))
    }

    async fn format_fat32(&self, partition: &PartitionHandle, label: &str) -> Result<()> {
        let args = vec![
            "-F".to_string(),
            "32".to_string(),
            "-n".to_string(),
            label.to_string(),
            partition.node.display().to_string(),
        ];
        self.runner
            .run_checked(Subphase::Format, "mkfs.fat", &args, self.timeouts.device_op())
            .await?;
        Ok(())
    }

    async fn mount(&self, partition: &PartitionHandle, at: &Path) -> Result<MountPoint> {
        tokio::fs::create_dir_all(at).await.map_err(|e| {
            ProvisionError::platform(Subphase::Mount, format!("cannot create {}: {}", at.display(), e))
        })?;
        let args = vec![
            "-t".to_string(),
            "vfat".to_string(),
            partition.node.display().to_string(),
            at.display().to_string(),
        ];
        self.runner
            .run_checked(Subphase::Mount, "mount", &args, self.timeouts.device_op())
            .await?;
        Ok(MountPoint {
            partition: partition.node.clone(),
            path: at.to_path_buf(),
        })
    }

    async fn unmount(&self, mount: &MountPoint) -> Result<()> {
        self.runner
            .run_checked(Subphase::Unmount, "sync", &[], self.timeouts.device_op())
            .await?;
        self.runner
            .run_checked(
                Subphase::Unmount,
                "umount",
                &[mount.path.display().to_string()],
                self.timeouts.device_op(),
            )
            .await?;
        if let Err(e) = tokio::fs::remove_dir(&mount.path).await {
            debug!("Leaving mount dir {}: {}", mount.path.display(), e);
        }
        Ok(())
    }
}
