// file: src/platform/windows.rs
// version: 1.0.0
// guid: 9b2e4f70-1c3d-4e8a-8f6b-7a5d0c2e9b14

//! Windows-family disk plumbing over PowerShell storage cmdlets
//!
//! Native Windows can enumerate, offline and online disks but has no raw
//! write or FAT tooling we can drive; those operations report
//! [`ProvisionError::Unsupported`].

use super::command::CommandRunner;
use super::{
    HostKind, HostPlatform, MountPoint, PartitionHandle, RejectReason, Subphase, TargetDevice,
    MAX_DEVICE_BYTES,
};
use crate::config::{Timeouts, ToolPaths};
use crate::error::ProvisionError;
use crate::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const ENUMERATE_SCRIPT: &str = "Get-Disk | Select-Object Number, FriendlyName, SerialNumber, Size, \
    @{n='BusType';e={[string]$_.BusType}}, IsBoot, IsSystem, IsOffline | ConvertTo-Json -Compress";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WindowsDisk {
    number: u32,
    #[serde(default)]
    friendly_name: Option<String>,
    #[serde(default)]
    serial_number: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    bus_type: Option<String>,
    #[serde(default)]
    is_boot: Option<bool>,
    #[serde(default)]
    is_system: Option<bool>,
}

impl WindowsDisk {
    fn to_target(&self) -> TargetDevice {
        let size = self.size.unwrap_or(0);
        let bus = self.bus_type.as_deref().unwrap_or("").to_ascii_uppercase();
        TargetDevice {
            platform_id: self.number.to_string(),
            path: physical_drive(self.number),
            size_bytes: size,
            model: self.friendly_name.as_deref().unwrap_or("").trim().to_string(),
            serial: self.serial_number.as_deref().unwrap_or("").trim().to_string(),
            removable: bus == "USB" || (bus == "SCSI" && size <= MAX_DEVICE_BYTES),
            is_system_or_boot: self.is_boot.unwrap_or(false) || self.is_system.unwrap_or(false),
        }
    }
}

/// `\\.\PHYSICALDRIVE<n>`
pub fn physical_drive(number: u32) -> PathBuf {
    PathBuf::from(format!(r"\\.\PHYSICALDRIVE{}", number))
}

/// Parse `Get-Disk | ConvertTo-Json`, which emits a bare object for one disk
/// and an array for several
pub(crate) fn parse_get_disk(json: &str) -> Result<Vec<TargetDevice>> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).map_err(|e| {
        ProvisionError::platform(Subphase::Enumerate, format!("unparseable Get-Disk output: {}", e))
    })?;
    let disks: Vec<WindowsDisk> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value),
        other => serde_json::from_value(other).map(|d| vec![d]),
    }
    .map_err(|e| ProvisionError::platform(Subphase::Enumerate, format!("unexpected Get-Disk record: {}", e)))?;

    Ok(disks.iter().map(WindowsDisk::to_target).collect())
}

/// Split `"C:|D:,E:"` into the system drive and the disk's drive letters
pub(crate) fn parse_drive_letters(output: &str) -> (String, Vec<String>) {
    let line = output.lines().find(|l| l.contains('|')).unwrap_or("");
    let (system, letters) = line.split_once('|').unwrap_or(("", ""));
    (
        system.trim().to_ascii_uppercase(),
        letters
            .split(',')
            .map(|l| l.trim().to_ascii_uppercase())
            .filter(|l| !l.is_empty())
            .collect(),
    )
}

/// Drive letters on `disk` that equal the host's system drive
pub(crate) fn reserved_letters(output: &str) -> Vec<RejectReason> {
    let (system, letters) = parse_drive_letters(output);
    letters
        .into_iter()
        .filter(|l| !system.is_empty() && *l == system)
        .map(RejectReason::ReservedDriveLetter)
        .collect()
}

/// Disk number of a Windows-family device
pub(crate) fn disk_number(device: &TargetDevice) -> Result<u32> {
    device.platform_id.parse().map_err(|_| {
        ProvisionError::platform(
            Subphase::Enumerate,
            format!("{} has no Windows disk number", device.path.display()),
        )
    })
}

/// Thin wrapper running scripts through `powershell.exe`
pub(crate) struct PowerShell {
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl PowerShell {
    pub(crate) fn new(runner: Arc<dyn CommandRunner>, program: &str) -> Self {
        Self {
            runner,
            program: program.to_string(),
        }
    }

    pub(crate) async fn run(&self, subphase: Subphase, script: &str, timeout: Duration) -> Result<String> {
        let args = vec![
            "-NoProfile".to_string(),
            "-NonInteractive".to_string(),
            "-Command".to_string(),
            script.to_string(),
        ];
        self.runner.run_checked(subphase, &self.program, &args, timeout).await
    }

    pub(crate) async fn list_disks(&self, timeout: Duration) -> Result<Vec<TargetDevice>> {
        let stdout = self.run(Subphase::Enumerate, ENUMERATE_SCRIPT, timeout).await?;
        parse_get_disk(&stdout)
    }

    pub(crate) async fn reserved_letters(&self, number: u32, timeout: Duration) -> Result<Vec<RejectReason>> {
        let script = format!(
            "$letters = (Get-Partition -DiskNumber {} -ErrorAction SilentlyContinue | \
             Where-Object DriveLetter | ForEach-Object {{ \"$($_.DriveLetter):\" }}) -join ','; \
             \"$($env:SystemDrive)|$letters\"",
            number
        );
        let stdout = self.run(Subphase::Enumerate, &script, timeout).await?;
        Ok(reserved_letters(&stdout))
    }

    pub(crate) async fn set_offline(&self, number: u32, offline: bool, timeout: Duration) -> Result<()> {
        let subphase = if offline { Subphase::Offline } else { Subphase::Online };
        let script = format!(
            "Set-Disk -Number {} -IsOffline ${}",
            number,
            if offline { "true" } else { "false" }
        );
        self.run(subphase, &script, timeout).await?;
        Ok(())
    }
}

/// Windows-native host strategy
pub struct WindowsPlatform {
    powershell: PowerShell,
    timeouts: Timeouts,
}

impl WindowsPlatform {
    pub fn new(runner: Arc<dyn CommandRunner>, timeouts: Timeouts, tools: ToolPaths) -> Self {
        Self {
            powershell: PowerShell::new(runner, &tools.powershell),
            timeouts,
        }
    }

    fn unsupported(what: &str) -> ProvisionError {
        ProvisionError::unsupported(format!("{} is not available on native Windows", what))
    }
}

#[async_trait]
impl HostPlatform for WindowsPlatform {
    fn kind(&self) -> HostKind {
        HostKind::Windows
    }

    fn supports_raw_write(&self) -> bool {
        false
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
        info!("Taking disk {} offline", device.platform_id);
        self.powershell
            .set_offline(disk_number(device)?, true, self.timeouts.device_op())
            .await
    }

    async fn online(&self, device: &TargetDevice) -> Result<()> {
        info!("Bringing disk {} online", device.platform_id);
        self.powershell
            .set_offline(disk_number(device)?, false, self.timeouts.device_op())
            .await
    }

    async fn raw_write(&self, _image: &Path, _device: &TargetDevice) -> Result<()> {
        Err(Self::unsupported("raw disk write"))
    }

    async fn reset_partition_table(&self, _device: &TargetDevice) -> Result<()> {
        Err(Self::unsupported("partitioning"))
    }

    async fn append_partition(
        &self,
        _device: &TargetDevice,
        _name: &str,
        _size_mib: Option<u64>,
    ) -> Result<PartitionHandle> {
        Err(Self::unsupported("partitioning"))
    }

    async fn format_fat32(&self, _partition: &PartitionHandle, _label: &str) -> Result<()> {
        Err(Self::unsupported("FAT32 formatting"))
    }

    async fn mount(&self, _partition: &PartitionHandle, _at: &Path) -> Result<MountPoint> {
        Err(Self::unsupported("mounting"))
    }

    async fn unmount(&self, _mount: &MountPoint) -> Result<()> {
        Err(Self::unsupported("unmounting"))
    }
}
