// file: src/platform/wsl.rs
// version: 1.1.0
// guid: c7f1a9e2-4d6b-4b0c-a3e8-5f2d8b1c7e36

//! WSL strategy: the disk is enumerated and taken offline on the Windows side,
//! passed through with `wsl --mount --bare`, then written and partitioned
//! with the Linux toolchain inside the distribution.

use super::command::CommandRunner;
use super::linux::LinuxPlatform;
use super::windows::{disk_number, physical_drive, PowerShell};
use super::{
    HostKind, HostPlatform, MountPoint, PartitionHandle, RejectReason, Subphase, TargetDevice,
};
use crate::config::{Timeouts, ToolPaths};
use crate::error::ProvisionError;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const ATTACH_POLL_ATTEMPTS: u32 = 20;
const ATTACH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// WSL host strategy
pub struct WslPlatform {
    runner: Arc<dyn CommandRunner>,
    powershell: PowerShell,
    linux: LinuxPlatform,
    wsl_program: String,
    timeouts: Timeouts,
    poll_interval: Duration,
    /// Disk number → Linux node, `None` while `wsl --mount` ran but no node was found yet
    attached: Mutex<HashMap<String, Option<PathBuf>>>,
}

impl WslPlatform {
    pub fn new(runner: Arc<dyn CommandRunner>, timeouts: Timeouts, tools: ToolPaths) -> Self {
        Self {
            powershell: PowerShell::new(runner.clone(), &tools.powershell),
            linux: LinuxPlatform::new(runner.clone(), timeouts.clone()),
            runner,
            wsl_program: tools.wsl,
            timeouts,
            poll_interval: ATTACH_POLL_INTERVAL,
            attached: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn attached(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<PathBuf>>> {
        self.attached.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The device as the Linux side sees it once attached
    fn linux_view(&self, device: &TargetDevice, subphase: Subphase) -> Result<TargetDevice> {
        let node = self
            .attached()
            .get(&device.platform_id)
            .cloned()
            .flatten()
            .ok_or_else(|| {
                ProvisionError::platform(
                    subphase,
                    format!("disk {} is not attached to WSL", device.platform_id),
                )
            })?;
        Ok(TargetDevice {
            platform_id: node
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: node,
            ..device.clone()
        })
    }

    async fn wsl(&self, subphase: Subphase, args: &[String]) -> Result<()> {
        self.runner
            .run_checked(subphase, &self.wsl_program, args, self.timeouts.device_op())
            .await
            .map(|_| ())
    }

    async fn wait_for_new_disk(&self, before: &[String]) -> Result<PathBuf> {
        for _ in 0..ATTACH_POLL_ATTEMPTS {
            let after = self.linux.disk_names(Subphase::Mount).await?;
            let fresh: Vec<&String> = after.iter().filter(|n| !before.contains(n)).collect();
            match fresh.as_slice() {
                [one] => return Ok(PathBuf::from(format!("/dev/{}", one))),
                [] => tokio::time::sleep(self.poll_interval).await,
                many => {
                    return Err(ProvisionError::platform(
                        Subphase::Mount,
                        format!("several block devices appeared at once: {:?}", many),
                    ))
                }
            }
        }
        Err(ProvisionError::platform(
            Subphase::Mount,
            "no new block device appeared after wsl --mount",
        ))
    }
}

#[async_trait]
impl HostPlatform for WslPlatform {
    fn kind(&self) -> HostKind {
        HostKind::Wsl
    }

    fn missing_tools(&self) -> Vec<String> {
        self.linux.missing_tools()
    }

    async fn list_block_devices(&self) -> Result<Vec<TargetDevice>> {
        self.powershell.list_disks(self.timeouts.enumerate()).await
    }

    async fn blocking_mounts(&self, device: &TargetDevice) -> Result<Vec<RejectReason>> {
        self.powershell
            .reserved_letters(disk_number(device)?, self.timeouts.enumerate())
            .await
    }

    async fn offline(&self, device: &TargetDevice) -> Result<()> {
        let number = disk_number(device)?;
        let before = self.linux.disk_names(Subphase::Mount).await?;

        info!("Taking disk {} offline on the Windows side", number);
        self.powershell
            .set_offline(number, true, self.timeouts.device_op())
            .await?;

        let drive = physical_drive(number).display().to_string();
        self.wsl(
            Subphase::Mount,
            &["--mount".to_string(), drive, "--bare".to_string()],
        )
        .await?;
        self.attached().insert(device.platform_id.clone(), None);

        let node = self.wait_for_new_disk(&before).await?;
        info!("Disk {} attached as {}", number, node.display());
        self.attached().insert(device.platform_id.clone(), Some(node));
        Ok(())
    }

    async fn online(&self, device: &TargetDevice) -> Result<()> {
        let number = disk_number(device)?;
        let was_attached = self.attached().remove(&device.platform_id).is_some();

        let detach = if was_attached {
            let drive = physical_drive(number).display().to_string();
            self.wsl(Subphase::Unmount, &["--unmount".to_string(), drive])
                .await
        } else {
            Ok(())
        };
        if let Err(e) = &detach {
            warn!("wsl --unmount failed for disk {}: {}", number, e);
        }

        // Online is attempted even when the detach failed
        let online = self
            .powershell
            .set_offline(number, false, self.timeouts.device_op())
            .await;
        debug!("Disk {} back online: {}", number, online.is_ok());

        detach.and(online)
    }

    async fn raw_write(&self, image: &Path, device: &TargetDevice) -> Result<()> {
        let view = self.linux_view(device, Subphase::Write)?;
        self.linux.raw_write(image, &view).await
    }

    async fn reset_partition_table(&self, device: &TargetDevice) -> Result<()> {
        let view = self.linux_view(device, Subphase::Partition)?;
        self.linux.reset_partition_table(&view).await
    }

    async fn append_partition(
        &self,
        device: &TargetDevice,
        name: &str,
        size_mib: Option<u64>,
    ) -> Result<PartitionHandle> {
        let view = self.linux_view(device, Subphase::Partition)?;
        self.linux.append_partition(&view, name, size_mib).await
    }

    async fn format_fat32(&self, partition: &PartitionHandle, label: &str) -> Result<()> {
        self.linux.format_fat32(partition, label).await
    }

    async fn mount(&self, partition: &PartitionHandle, at: &Path) -> Result<MountPoint> {
        self.linux.mount(partition, at).await
    }

    async fn unmount(&self, mount: &MountPoint) -> Result<()> {
        self.linux.unmount(mount).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::command::{CommandOutput, Scripted, ScriptedRunner};

    const BEFORE: &str = r#"{"blockdevices":[{"name":"sda","type":"disk"},{"name":"sdb","type":"disk"}]}"#;
    const AFTER: &str = r#"{"blockdevices":[{"name":"sda","type":"disk"},{"name":"sdb","type":"disk"},{"name":"sdd","type":"disk"}]}"#;

    fn usb_disk() -> TargetDevice {
        TargetDevice {
            platform_id: "2".into(),
            path: physical_drive(2),
            size_bytes: 16 << 30,
            model: "SanDisk Ultra".into(),
            serial: "4C53".into(),
            removable: true,
            is_system_or_boot: false,
        }
    }

    #[tokio::test]
    async fn test_offline_attaches_new_node() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .respond("lsblk", None, Scripted::Output(CommandOutput::ok(BEFORE)))
                .respond("lsblk", None, Scripted::Output(CommandOutput::ok(BEFORE)))
                .respond("lsblk", None, Scripted::Output(CommandOutput::ok(AFTER))),
        );
        let wsl = WslPlatform::new(runner.clone(), Timeouts::default(), ToolPaths::default())
            .with_poll_interval(Duration::from_millis(1));
        let disk = usb_disk();

        wsl.offline(&disk).await.unwrap();
        let view = wsl.linux_view(&disk, Subphase::Write).unwrap();
        assert_eq!(view.path, PathBuf::from("/dev/sdd"));

        let lines = runner.command_lines();
        assert!(lines[1].ends_with("Set-Disk -Number 2 -IsOffline $true"));
        assert_eq!(lines[2], r"wsl.exe --mount \\.\PHYSICALDRIVE2 --bare");
    }

    #[tokio::test]
    async fn test_online_unmounts_then_onlines() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .respond("lsblk", None, Scripted::Output(CommandOutput::ok(BEFORE)))
                .respond("lsblk", None, Scripted::Output(CommandOutput::ok(AFTER))),
        );
        let wsl = WslPlatform::new(runner.clone(), Timeouts::default(), ToolPaths::default())
            .with_poll_interval(Duration::from_millis(1));
        let disk = usb_disk();
        wsl.offline(&disk).await.unwrap();

        wsl.online(&disk).await.unwrap();

        let lines = runner.command_lines();
        let n = lines.len();
        assert_eq!(lines[n - 2], r"wsl.exe --unmount \\.\PHYSICALDRIVE2");
        assert!(lines[n - 1].ends_with("Set-Disk -Number 2 -IsOffline $false"));
        assert!(wsl.linux_view(&disk, Subphase::Write).is_err());
    }

    #[tokio::test]
    async fn test_online_still_runs_when_detach_fails() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .respond("lsblk", None, Scripted::Output(CommandOutput::ok(BEFORE)))
                .respond("lsblk", None, Scripted::Output(CommandOutput::ok(AFTER)))
                .respond("wsl.exe", Some("--unmount"), Scripted::Output(CommandOutput::failed(1, "busy"))),
        );
        let wsl = WslPlatform::new(runner.clone(), Timeouts::default(), ToolPaths::default())
            .with_poll_interval(Duration::from_millis(1));
        let disk = usb_disk();
        wsl.offline(&disk).await.unwrap();

        let err = wsl.online(&disk).await.unwrap_err();

        assert_eq!(err.subphase(), Some(Subphase::Unmount));
        assert!(runner
            .command_lines()
            .last()
            .unwrap()
            .ends_with("Set-Disk -Number 2 -IsOffline $false"));
    }

    #[tokio::test]
    async fn test_write_requires_attachment() {
        let runner = Arc::new(ScriptedRunner::new());
        let wsl = WslPlatform::new(runner, Timeouts::default(), ToolPaths::default());

        let err = wsl.raw_write(Path::new("x.iso"), &usb_disk()).await.unwrap_err();
        assert_eq!(err.subphase(), Some(Subphase::Write));
    }

    #[tokio::test]
    async fn test_no_new_node_fails_mount() {
        let runner = Arc::new(ScriptedRunner::new().always(
            "lsblk",
            None,
            Scripted::Output(CommandOutput::ok(BEFORE)),
        ));
        let wsl = WslPlatform::new(runner, Timeouts::default(), ToolPaths::default())
            .with_poll_interval(Duration::from_millis(1));

        let err = wsl.offline(&usb_disk()).await.unwrap_err();
        assert_eq!(err.subphase(), Some(Subphase::Mount));
    }
}
