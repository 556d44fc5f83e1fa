// file: src/platform/mod.rs
// version: 1.1.0
// guid: b4539b7e-9c35-4df4-bdf0-358fcb499e6c

//! Host platform adapter
//!
//! Hides block-device enumeration, raw writes and partition/format/mount work
//! behind [`HostPlatform`] so the pipeline runs identically against Linux, WSL,
//! Windows or the in-memory [`fake::FakePlatform`].
//!
//! Every operation is total: it either completes or returns an error naming
//! the [`Subphase`] that failed.

pub mod command;
pub mod confirm;
pub mod fake;
pub mod linux;
pub mod windows;
pub mod wsl;

pub use command::{CommandOutput, CommandRunner, ScriptedRunner, SystemRunner};
pub use confirm::{AlwaysConfirm, Confirmer, StdinConfirmer};
pub use linux::LinuxPlatform;
pub use windows::WindowsPlatform;
pub use wsl::WslPlatform;

use crate::config::Settings;
use crate::error::ProvisionError;
use crate::utils::format_size;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Smallest device accepted as provisioning target
pub const MIN_DEVICE_BYTES: u64 = 1 << 30;
/// Largest device accepted as provisioning target
pub const MAX_DEVICE_BYTES: u64 = 2 << 40;

/// GPT partition name of the appended seed partition
pub const SEED_PARTITION_NAME: &str = "CIDATA";

/// Host adapter subphases, used to name failures precisely
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subphase {
    Enumerate,
    Offline,
    Mount,
    Write,
    Partition,
    Format,
    Copy,
    Unmount,
    Online,
}

impl Subphase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subphase::Enumerate => "enumerate",
            Subphase::Offline => "offline",
            Subphase::Mount => "mount",
            Subphase::Write => "write",
            Subphase::Partition => "partition",
            Subphase::Format => "format",
            Subphase::Copy => "copy",
            Subphase::Unmount => "unmount",
            Subphase::Online => "online",
        }
    }
}

impl fmt::Display for Subphase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a device failed the safety predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    /// Flagged as system or boot disk by the host
    SystemPartition,
    /// A partition carries an active root/boot mount
    SystemMount(String),
    /// A partition carries the host's reserved drive letter
    ReservedDriveLetter(String),
    /// Size outside the accepted band
    SizeOutOfRange(u64),
}

impl RejectReason {
    /// Stable machine-readable reason
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::SystemPartition | RejectReason::SystemMount(_) => "system_partition",
            RejectReason::ReservedDriveLetter(_) => "reserved_drive_letter",
            RejectReason::SizeOutOfRange(_) => "size_out_of_range",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::SystemPartition => write!(f, "{}", self.as_str()),
            RejectReason::SystemMount(mount) => write!(f, "{} ({} is mounted)", self.as_str(), mount),
            RejectReason::ReservedDriveLetter(letter) => {
                write!(f, "{} ({} lives on this disk)", self.as_str(), letter)
            }
            RejectReason::SizeOutOfRange(size) => write!(
                f,
                "{} ({} outside {}..={})",
                self.as_str(),
                size,
                MIN_DEVICE_BYTES,
                MAX_DEVICE_BYTES
            ),
        }
    }
}

/// A block device as seen by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDevice {
    /// OS-native handle: kernel name on Linux, disk number on Windows
    pub platform_id: String,
    /// Canonical path (`/dev/sdb`, `\\.\PHYSICALDRIVE2`)
    pub path: PathBuf,
    pub size_bytes: u64,
    pub model: String,
    pub serial: String,
    pub removable: bool,
    pub is_system_or_boot: bool,
}

impl TargetDevice {
    /// One-line description naming model, serial and size
    pub fn summary(&self) -> String {
        format!(
            "{} ({}, serial {}, {})",
            self.path.display(),
            if self.model.is_empty() { "unknown model" } else { &self.model },
            if self.serial.is_empty() { "n/a" } else { &self.serial },
            format_size(self.size_bytes)
        )
    }

    pub fn size_in_band(&self) -> bool {
        size_in_band(self.size_bytes)
    }

    /// Removable and inside the size band
    pub fn is_candidate(&self) -> bool {
        self.removable && self.size_in_band()
    }
}

/// `size ∈ [1 GiB, 2 TiB]`
pub fn size_in_band(size_bytes: u64) -> bool {
    (MIN_DEVICE_BYTES..=MAX_DEVICE_BYTES).contains(&size_bytes)
}

/// Static part of the safety predicate (no host queries)
pub fn check_device_safety(device: &TargetDevice) -> std::result::Result<(), RejectReason> {
    if device.is_system_or_boot {
        return Err(RejectReason::SystemPartition);
    }
    if !device.size_in_band() {
        return Err(RejectReason::SizeOutOfRange(device.size_bytes));
    }
    Ok(())
}

/// Collapse records sharing a serial, preferring the one with a model string
pub fn dedupe_by_serial(devices: Vec<TargetDevice>) -> Vec<TargetDevice> {
    let mut out: Vec<TargetDevice> = Vec::with_capacity(devices.len());
    for device in devices {
        if device.serial.is_empty() {
            out.push(device);
            continue;
        }
        match out.iter_mut().find(|d| d.serial == device.serial) {
            Some(existing) => {
                if existing.model.is_empty() && !device.model.is_empty() {
                    *existing = device;
                }
            }
            None => out.push(device),
        }
    }
    out
}

/// A partition created on a target device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionHandle {
    /// Device the partition lives on
    pub device: PathBuf,
    /// Partition block node
    pub node: PathBuf,
    pub number: u32,
    pub name: String,
}

/// A mounted partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountPoint {
    pub partition: PathBuf,
    pub path: PathBuf,
}

/// Host family the tool runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    Linux,
    Wsl,
    Windows,
}

impl HostKind {
    /// Detect the current host
    pub fn detect() -> Self {
        if cfg!(windows) {
            return HostKind::Windows;
        }
        let proc_version = std::fs::read_to_string("/proc/version").unwrap_or_default();
        Self::classify(
            std::env::var_os("WSL_DISTRO_NAME").is_some() || std::env::var_os("WSL_INTEROP").is_some(),
            &proc_version,
        )
    }

    pub(crate) fn classify(wsl_env: bool, proc_version: &str) -> Self {
        if wsl_env || proc_version.to_ascii_lowercase().contains("microsoft") {
            HostKind::Wsl
        } else {
            HostKind::Linux
        }
    }

    /// Windows-family hosts address disks by number and drive letter
    pub fn is_windows_family(&self) -> bool {
        matches!(self, HostKind::Wsl | HostKind::Windows)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HostKind::Linux => "linux",
            HostKind::Wsl => "wsl",
            HostKind::Windows => "windows",
        }
    }
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability interface over the host's administrative disk tooling
#[async_trait]
pub trait HostPlatform: Send + Sync {
    fn kind(&self) -> HostKind;

    /// Whether [`HostPlatform::raw_write`] can succeed at all on this host
    fn supports_raw_write(&self) -> bool {
        true
    }

    /// Host tools this strategy shells out to that are absent from PATH
    fn missing_tools(&self) -> Vec<String> {
        Vec::new()
    }

    /// Every whole disk the host reports, unfiltered
    async fn list_block_devices(&self) -> Result<Vec<TargetDevice>>;

    /// Mount targets (or drive letters) on `device` that make it unsafe to write
    async fn blocking_mounts(&self, device: &TargetDevice) -> Result<Vec<RejectReason>>;

    /// Take the device away from the host: offline (Windows family) or unmount-all + lock (Linux)
    async fn offline(&self, device: &TargetDevice) -> Result<()>;

    /// Give the device back to the host; the cleanup path of every session
    async fn online(&self, device: &TargetDevice) -> Result<()>;

    /// Bit-exact copy of `image` onto the raw device, flushed before returning
    async fn raw_write(&self, image: &Path, device: &TargetDevice) -> Result<()>;

    /// Replace the partition table with an empty GPT
    async fn reset_partition_table(&self, device: &TargetDevice) -> Result<()>;

    /// Append a generic-data GPT partition after the existing ones.
    /// `size_mib = None` takes the remaining space.
    async fn append_partition(
        &self,
        device: &TargetDevice,
        name: &str,
        size_mib: Option<u64>,
    ) -> Result<PartitionHandle>;

    async fn format_fat32(&self, partition: &PartitionHandle, label: &str) -> Result<()>;

    async fn mount(&self, partition: &PartitionHandle, at: &Path) -> Result<MountPoint>;

    async fn unmount(&self, mount: &MountPoint) -> Result<()>;

    /// Removable candidates inside the size band
    async fn enumerate_devices(&self) -> Result<Vec<TargetDevice>> {
        let devices = self.list_block_devices().await?;
        Ok(dedupe_by_serial(
            devices.into_iter().filter(TargetDevice::is_candidate).collect(),
        ))
    }

    /// Look up a device by path or platform id, whether or not it is a candidate
    async fn describe_device(&self, path: &Path) -> Result<Option<TargetDevice>> {
        let wanted = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());
        let devices = self.list_block_devices().await?;
        Ok(devices.into_iter().find(|d| {
            d.path == wanted || d.path == path || Path::new(&d.platform_id) == path
        }))
    }

    /// Full safety predicate: static checks plus live mounts
    async fn validate_device(&self, device: &TargetDevice) -> Result<()> {
        let reject = |reason| ProvisionError::DeviceRejected {
            device: device.path.display().to_string(),
            reason,
        };
        check_device_safety(device).map_err(reject)?;
        if let Some(reason) = self.blocking_mounts(device).await?.into_iter().next() {
            return Err(reject(reason));
        }
        Ok(())
    }
}

/// Build the platform strategy for `kind`
pub fn for_host(kind: HostKind, settings: &Settings) -> Arc<dyn HostPlatform> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
    match kind {
        HostKind::Linux => Arc::new(LinuxPlatform::new(runner, settings.timeouts.clone())),
        HostKind::Wsl => Arc::new(WslPlatform::new(
            runner,
            settings.timeouts.clone(),
            settings.tools.clone(),
        )),
        HostKind::Windows => Arc::new(WindowsPlatform::new(
            runner,
            settings.timeouts.clone(),
            settings.tools.clone(),
        )),
    }
}
