// file: src/platform/fake.rs
// version: 1.1.0
// guid: 2d8c5b13-6e7f-4a91-b0c4-9e3a7f15d268

//! In-memory host platform for exercising the pipeline without hardware
//!
//! Every call lands in a journal, failures can be injected per subphase and
//! files copied into a mounted seed partition are captured on unmount.

use super::{
    HostKind, HostPlatform, MountPoint, PartitionHandle, RejectReason, Subphase, TargetDevice,
};
use crate::error::ProvisionError;
use crate::pipeline::CancelToken;
use crate::platform::linux::SYSTEM_MOUNTS;
use crate::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Partitions an Ubuntu hybrid ISO leaves on the device after a raw write
const IMAGE_PARTITIONS: u32 = 2;

/// Journal entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    Enumerate,
    Offline(PathBuf),
    Online(PathBuf),
    RawWrite { image: PathBuf, device: PathBuf },
    ResetTable(PathBuf),
    AppendPartition { device: PathBuf, name: String, size_mib: Option<u64> },
    Format { node: PathBuf, label: String },
    Mount { node: PathBuf, at: PathBuf },
    Unmount(PathBuf),
}

impl FakeCall {
    pub fn subphase(&self) -> Subphase {
        match self {
            FakeCall::Enumerate => Subphase::Enumerate,
            FakeCall::Offline(_) => Subphase::Offline,
            FakeCall::Online(_) => Subphase::Online,
            FakeCall::RawWrite { .. } => Subphase::Write,
            FakeCall::ResetTable(_) | FakeCall::AppendPartition { .. } => Subphase::Partition,
            FakeCall::Format { .. } => Subphase::Format,
            FakeCall::Mount { .. } => Subphase::Mount,
            FakeCall::Unmount(_) => Subphase::Unmount,
        }
    }
}

/// Injected failure for a subphase
#[derive(Debug, Clone)]
pub enum Injected {
    Fail(String),
    Timeout(u64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakePartition {
    pub node: PathBuf,
    pub number: u32,
    pub name: String,
    pub label: Option<String>,
    /// Files found on the partition at unmount, keyed by name
    pub files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct FakeDisk {
    pub device: TargetDevice,
    pub mounts: Vec<String>,
    pub reserved: Vec<RejectReason>,
    pub offline: bool,
    pub written_image: Option<PathBuf>,
    pub partitions: Vec<FakePartition>,
}

#[derive(Debug, Default)]
struct FakeState {
    disks: Vec<FakeDisk>,
    calls: Vec<FakeCall>,
    failures: HashMap<Subphase, Injected>,
    cancel_after: HashMap<Subphase, CancelToken>,
    missing_tools: Vec<String>,
    mounted: HashMap<PathBuf, PathBuf>,
    unsafe_writes: usize,
}

/// Scriptable stand-in for a real host
pub struct FakePlatform {
    kind: HostKind,
    state: Mutex<FakeState>,
}

/// A removable USB stick
pub fn usb_stick(path: &str, size_bytes: u64, model: &str, serial: &str) -> TargetDevice {
    TargetDevice {
        platform_id: path.trim_start_matches("/dev/").to_string(),
        path: PathBuf::from(path),
        size_bytes,
        model: model.to_string(),
        serial: serial.to_string(),
        removable: true,
        is_system_or_boot: false,
    }
}

/// The disk the host runs from
pub fn system_disk(path: &str, size_bytes: u64) -> TargetDevice {
    TargetDevice {
        removable: false,
        is_system_or_boot: true,
        ..usb_stick(path, size_bytes, "Internal SSD", "SYS0001")
    }
}

impl FakePlatform {
    pub fn new(kind: HostKind) -> Self {
        Self {
            kind,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn with_disk(self, device: TargetDevice) -> Self {
        self.state().disks.push(FakeDisk {
            device,
            mounts: Vec::new(),
            reserved: Vec::new(),
            offline: false,
            written_image: None,
            partitions: Vec::new(),
        });
        self
    }

    /// Mount targets currently active on the disk at `path`
    pub fn with_mounts(self, path: &str, mounts: &[&str]) -> Self {
        if let Some(disk) = self.find_mut(&mut self.state(), Path::new(path)) {
            disk.mounts = mounts.iter().map(|m| m.to_string()).collect();
        }
        self
    }

    /// Mark a reserved drive letter on the disk at `path`
    pub fn with_reserved_letter(self, path: &str, letter: &str) -> Self {
        if let Some(disk) = self.find_mut(&mut self.state(), Path::new(path)) {
            disk.reserved.push(RejectReason::ReservedDriveLetter(letter.to_string()));
        }
        self
    }

    /// Make every call of `subphase` fail
    pub fn with_failure(self, subphase: Subphase, failure: Injected) -> Self {
        self.state().failures.insert(subphase, failure);
        self
    }

    /// Report `tools` as absent from PATH
    pub fn with_missing_tools(self, tools: &[&str]) -> Self {
        self.state().missing_tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Cancel `token` once a call of `subphase` has succeeded
    pub fn with_cancel_after(self, subphase: Subphase, token: CancelToken) -> Self {
        self.state().cancel_after.insert(subphase, token);
        self
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.state().calls.clone()
    }

    /// Subphases in call order, enumeration excluded
    pub fn trace(&self) -> Vec<Subphase> {
        self.state()
            .calls
            .iter()
            .filter(|c| **c != FakeCall::Enumerate)
            .map(FakeCall::subphase)
            .collect()
    }

    pub fn count(&self, subphase: Subphase) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.subphase() == subphase)
            .count()
    }

    pub fn disk(&self, path: &str) -> Option<FakeDisk> {
        self.state()
            .disks
            .iter()
            .find(|d| d.device.path == Path::new(path))
            .cloned()
    }

    /// Raw writes attempted against a system or boot disk
    pub fn unsafe_writes(&self) -> usize {
        self.state().unsafe_writes
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn find_mut<'a>(&self, state: &'a mut FakeState, path: &Path) -> Option<&'a mut FakeDisk> {
        state.disks.iter_mut().find(|d| d.device.path == path)
    }

    /// Journal the call, then apply any injected failure
    fn enter(&self, call: FakeCall) -> Result<()> {
        let subphase = call.subphase();
        let mut state = self.state();
        state.calls.push(call);
        match state.failures.get(&subphase) {
            None => {
                if let Some(token) = state.cancel_after.get(&subphase) {
                    token.cancel();
                }
                Ok(())
            }
            Some(Injected::Fail(msg)) => Err(ProvisionError::platform(subphase, msg.clone())),
            Some(Injected::Timeout(secs)) => Err(ProvisionError::Timeout {
                subphase,
                secs: *secs,
            }),
        }
    }

    fn with_disk_state<T>(
        &self,
        path: &Path,
        subphase: Subphase,
        f: impl FnOnce(&mut FakeDisk) -> T,
    ) -> Result<T> {
        let mut state = self.state();
        let disk = self.find_mut(&mut state, path).ok_or_else(|| {
            ProvisionError::platform(subphase, format!("no such device {}", path.display()))
        })?;
        Ok(f(disk))
    }
}

#[async_trait]
impl HostPlatform for FakePlatform {
    fn kind(&self) -> HostKind {
        self.kind
    }

    fn supports_raw_write(&self) -> bool {
        self.kind != HostKind::Windows
    }

    fn missing_tools(&self) -> Vec<String> {
        self.state().missing_tools.clone()
    }

    async fn list_block_devices(&self) -> Result<Vec<TargetDevice>> {
        self.enter(FakeCall::Enumerate)?;
        Ok(self.state().disks.iter().map(|d| d.device.clone()).collect())
    }

    async fn blocking_mounts(&self, device: &TargetDevice) -> Result<Vec<RejectReason>> {
        self.with_disk_state(&device.path, Subphase::Enumerate, |disk| {
            disk.mounts
                .iter()
                .filter(|m| SYSTEM_MOUNTS.contains(&m.as_str()))
                .map(|m| RejectReason::SystemMount(m.clone()))
                .chain(disk.reserved.iter().cloned())
                .collect()
        })
    }

    async fn offline(&self, device: &TargetDevice) -> Result<()> {
        self.enter(FakeCall::Offline(device.path.clone()))?;
        self.with_disk_state(&device.path, Subphase::Offline, |disk| {
            disk.mounts.clear();
            disk.offline = true;
        })
    }

    async fn online(&self, device: &TargetDevice) -> Result<()> {
        self.enter(FakeCall::Online(device.path.clone()))?;
        self.with_disk_state(&device.path, Subphase::Online, |disk| disk.offline = false)
    }

    async fn raw_write(&self, image: &Path, device: &TargetDevice) -> Result<()> {
        if device.is_system_or_boot {
            self.state().unsafe_writes += 1;
            return Err(ProvisionError::DeviceRejected {
                device: device.path.display().to_string(),
                reason: RejectReason::SystemPartition,
            });
        }
        self.enter(FakeCall::RawWrite {
            image: image.to_path_buf(),
            device: device.path.clone(),
        })?;
        self.with_disk_state(&device.path, Subphase::Write, |disk| {
            disk.written_image = Some(image.to_path_buf());
            disk.partitions = (1..=IMAGE_PARTITIONS)
                .map(|n| FakePartition {
                    node: PathBuf::from(format!("{}{}", disk.device.path.display(), n)),
                    number: n,
                    name: format!("ISO{}", n),
                    ..FakePartition::default()
                })
                .collect();
        })
    }

    async fn reset_partition_table(&self, device: &TargetDevice) -> Result<()> {
        self.enter(FakeCall::ResetTable(device.path.clone()))?;
        self.with_disk_state(&device.path, Subphase::Partition, |disk| {
            disk.partitions.clear();
            disk.written_image = None;
        })
    }

    async fn append_partition(
        &self,
        device: &TargetDevice,
        name: &str,
        size_mib: Option<u64>,
    ) -> Result<PartitionHandle> {
        self.enter(FakeCall::AppendPartition {
            device: device.path.clone(),
            name: name.to_string(),
            size_mib,
        })?;
        self.with_disk_state(&device.path, Subphase::Partition, |disk| {
            let number = disk.partitions.len() as u32 + 1;
            let node = PathBuf::from(format!("{}{}", disk.device.path.display(), number));
            disk.partitions.push(FakePartition {
                node: node.clone(),
                number,
                name: name.to_string(),
                ..FakePartition::default()
            });
            PartitionHandle {
                device: disk.device.path.clone(),
                node,
                number,
                name: name.to_string(),
            }
        })
    }

    async fn format_fat32(&self, partition: &PartitionHandle, label: &str) -> Result<()> {
        self.enter(FakeCall::Format {
            node: partition.node.clone(),
            label: label.to_string(),
        })?;
        self.with_disk_state(&partition.device, Subphase::Format, |disk| {
            if let Some(p) = disk.partitions.iter_mut().find(|p| p.node == partition.node) {
                p.label = Some(label.to_string());
                p.files.clear();
            }
        })
    }

    async fn mount(&self, partition: &PartitionHandle, at: &Path) -> Result<MountPoint> {
        self.enter(FakeCall::Mount {
            node: partition.node.clone(),
            at: at.to_path_buf(),
        })?;
        std::fs::create_dir_all(at)
            .map_err(|e| ProvisionError::platform(Subphase::Mount, e.to_string()))?;
        self.state()
            .mounted
            .insert(at.to_path_buf(), partition.device.clone());
        Ok(MountPoint {
            partition: partition.node.clone(),
            path: at.to_path_buf(),
        })
    }

    async fn unmount(&self, mount: &MountPoint) -> Result<()> {
        self.enter(FakeCall::Unmount(mount.path.clone()))?;

        let mut files = BTreeMap::new();
        if let Ok(entries) = std::fs::read_dir(&mount.path) {
            for entry in entries.flatten() {
                if let Ok(bytes) = std::fs::read(entry.path()) {
                    files.insert(entry.file_name().to_string_lossy().into_owned(), bytes);
                }
            }
        }
        let _ = std::fs::remove_dir_all(&mount.path);

        let device = self.state().mounted.remove(&mount.path).ok_or_else(|| {
            ProvisionError::platform(
                Subphase::Unmount,
                format!("{} is not mounted", mount.path.display()),
            )
        })?;
        self.with_disk_state(&device, Subphase::Unmount, |disk| {
            if let Some(p) = disk.partitions.iter_mut().find(|p| p.node == mount.partition) {
                p.files = files;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GIB: u64 = 1 << 30;

    #[tokio::test]
    async fn test_enumerate_skips_system_disk() {
        let fake = FakePlatform::new(HostKind::Linux)
            .with_disk(system_disk("/dev/sda", 500 * GIB))
            .with_disk(usb_stick("/dev/sdb", 16 * GIB, "SanDisk", "S1"));

        let candidates = fake.enumerate_devices().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].path, PathBuf::from("/dev/sdb"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_describe_device_follows_symlinks() {
        let dir = TempDir::new().unwrap();
        let node = dir.path().join("sdb");
        std::fs::write(&node, b"").unwrap();
        let node = std::fs::canonicalize(&node).unwrap();
        let link = dir.path().join("usb-SanDisk_S1");
        std::os::unix::fs::symlink(&node, &link).unwrap();
        let fake = FakePlatform::new(HostKind::Linux)
            .with_disk(usb_stick(node.to_str().unwrap(), 16 * GIB, "SanDisk", "S1"));

        let found = fake.describe_device(&link).await.unwrap().unwrap();

        assert_eq!(found.path, node);
        assert!(fake.describe_device(&dir.path().join("sdz")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_captures_seed_files_on_unmount() {
        let dir = TempDir::new().unwrap();
        let stick = usb_stick("/dev/sdb", 16 * GIB, "SanDisk", "S1");
        let fake = FakePlatform::new(HostKind::Linux).with_disk(stick.clone());

        fake.raw_write(Path::new("/tmp/ubuntu.iso"), &stick).await.unwrap();
        let part = fake.append_partition(&stick, "CIDATA", Some(64)).await.unwrap();
        fake.format_fat32(&part, "CIDATA").await.unwrap();
        let mount = fake.mount(&part, &dir.path().join("mnt")).await.unwrap();
        std::fs::write(mount.path.join("meta-data"), b"instance-id: x\n").unwrap();
        fake.unmount(&mount).await.unwrap();

        let disk = fake.disk("/dev/sdb").unwrap();
        assert_eq!(part.number, 3);
        let seed = &disk.partitions[2];
        assert_eq!(seed.label.as_deref(), Some("CIDATA"));
        assert!(seed.files.contains_key("meta-data"));
        assert!(!dir.path().join("mnt").exists());
    }

    #[tokio::test]
    async fn test_injected_failure_is_journaled() {
        let stick = usb_stick("/dev/sdb", 16 * GIB, "SanDisk", "S1");
        let fake = FakePlatform::new(HostKind::Linux)
            .with_disk(stick.clone())
            .with_failure(Subphase::Write, Injected::Timeout(1800));

        let err = fake.raw_write(Path::new("x.iso"), &stick).await.unwrap_err();

        assert!(matches!(err, ProvisionError::Timeout { subphase: Subphase::Write, .. }));
        assert_eq!(fake.count(Subphase::Write), 1);
    }

    #[tokio::test]
    async fn test_system_disk_write_is_refused() {
        let sda = system_disk("/dev/sda", 500 * GIB);
        let fake = FakePlatform::new(HostKind::Linux).with_disk(sda.clone());

        assert!(fake.raw_write(Path::new("x.iso"), &sda).await.is_err());
        assert_eq!(fake.unsafe_writes(), 1);
        assert!(fake.disk("/dev/sda").unwrap().written_image.is_none());
    }
}
