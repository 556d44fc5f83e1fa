// file: src/config/mod.rs
// version: 2.0.0
// guid: a1b2c3d4-e5f6-7a8b-9c0d-1e2f3a4b5c6d

//! Configuration module for the provisioning toolchain
//!
//! Handles the operator state tree, optional `config.yaml` settings and the
//! validated provisioning intent.

pub mod intent;
pub mod loader;

pub use intent::{DeviceSelector, FieldViolation, IntentRequest, ProvisionIntent};
pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-operator state directory
pub const STATE_DIR_NAME: &str = ".syntropy";

/// Operator state tree rooted at `<home>/.syntropy`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    /// Resolve from `HOME` / `USERPROFILE`, falling back to the platform home dir
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
            .or_else(|| dirs::home_dir().map(|home| Self::under_home(&home)))
            .ok_or_else(|| {
                crate::error::ProvisionError::config(
                    "cannot determine operator home directory (HOME / USERPROFILE unset)",
                )
            })
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        ["HOME", "USERPROFILE"]
            .iter()
            .filter_map(|key| lookup(key))
            .find(|v| !v.trim().is_empty())
            .map(|home| Self::under_home(Path::new(&home)))
    }

    /// State tree under an explicit home directory
    pub fn under_home(home: &Path) -> Self {
        Self {
            root: home.join(STATE_DIR_NAME),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.root.join("keys")
    }

    pub fn nodes_dir(&self) -> PathBuf {
        self.root.join("nodes")
    }

    pub fn iso_cache_dir(&self) -> PathBuf {
        self.root.join("cache").join("iso")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    /// Default root for session work directories.
    ///
    /// Windows-native hosts use `TEMP`; everything else stays inside the state tree.
    pub fn default_work_root(&self, windows_host: bool) -> PathBuf {
        if windows_host {
            std::env::var("TEMP")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir())
                .join("syntropy")
        } else {
            self.root.join("work")
        }
    }
}

/// Settings read from `~/.syntropy/config.yaml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub seed: SeedDefaults,
    pub timeouts: Timeouts,
    pub tools: ToolPaths,
}

/// Values the seed renderer derives for every node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedDefaults {
    pub locale: String,
    pub timezone: String,
    /// Primary interface carrying the management VLAN
    pub interface_name: String,
    /// Default gateway on the management VLAN
    pub gateway: String,
    /// First three octets of the mesh bridge network (/24)
    pub mesh_prefix: String,
    /// First three octets of the management VLAN network (/24)
    pub mgmt_prefix: String,
    pub mgmt_vlan_id: u16,
    pub nameservers: Vec<String>,
    /// Size of the appended CIDATA partition
    pub seed_partition_mib: u64,
}

impl Default for SeedDefaults {
    fn default() -> Self {
        Self {
            locale: "en_US.UTF-8".to_string(),
            timezone: "UTC".to_string(),
            interface_name: "eth0".to_string(),
            gateway: "10.43.0.1".to_string(),
            mesh_prefix: "10.42.0".to_string(),
            mgmt_prefix: "10.43.0".to_string(),
            mgmt_vlan_id: 100,
            nameservers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            seed_partition_mib: 64,
        }
    }
}

/// Per-operation subprocess timeouts, in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub download_secs: u64,
    pub raw_write_secs: u64,
    /// Partition, format, mount, unmount, offline and online
    pub device_op_secs: u64,
    pub enumerate_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            download_secs: 30 * 60,
            raw_write_secs: 30 * 60,
            device_op_secs: 30,
            enumerate_secs: 30,
        }
    }
}

impl Timeouts {
    pub fn download(&self) -> Duration {
        Duration::from_secs(self.download_secs)
    }

    pub fn raw_write(&self) -> Duration {
        Duration::from_secs(self.raw_write_secs)
    }

    pub fn device_op(&self) -> Duration {
        Duration::from_secs(self.device_op_secs)
    }

    pub fn enumerate(&self) -> Duration {
        Duration::from_secs(self.enumerate_secs)
    }
}

/// Overrides for external tool locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub powershell: String,
    pub wsl: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            powershell: "powershell.exe".to_string(),
            wsl: "wsl.exe".to_string(),
        }
    }
}

impl Settings {
    /// Validate settings loaded from disk
    pub fn validate(&self) -> crate::Result<()> {
        self.seed.validate()?;

        let t = &self.timeouts;
        if t.download_secs == 0 || t.raw_write_secs == 0 || t.device_op_secs == 0 || t.enumerate_secs == 0 {
            return Err(crate::error::ProvisionError::config(
                "timeouts must be greater than zero",
            ));
        }

        Ok(())
    }
}

impl SeedDefaults {
    /// Validate network defaults
    pub fn validate(&self) -> crate::Result<()> {
        let err = |msg: String| Err(crate::error::ProvisionError::config(msg));

        if self.interface_name.is_empty() {
            return err("seed.interface_name cannot be empty".to_string());
        }
        if self.gateway.parse::<IpAddr>().is_err() {
            return err(format!("seed.gateway is not an IP address: {}", self.gateway));
        }
        for (field, prefix) in [("mesh_prefix", &self.mesh_prefix), ("mgmt_prefix", &self.mgmt_prefix)] {
            if !is_three_octets(prefix) {
                return err(format!("seed.{} must look like 10.42.0: {}", field, prefix));
            }
        }
        if !(1..=4094).contains(&self.mgmt_vlan_id) {
            return err(format!("seed.mgmt_vlan_id out of range: {}", self.mgmt_vlan_id));
        }
        if self.nameservers.is_empty() {
            return err("seed.nameservers cannot be empty".to_string());
        }
        for ns in &self.nameservers {
            if ns.parse::<IpAddr>().is_err() {
                return err(format!("seed.nameservers entry is not an IP address: {}", ns));
            }
        }
        // mkfs.fat refuses FAT32 below ~33 MiB with 512-byte clusters
        if self.seed_partition_mib < 34 {
            return err(format!(
                "seed.seed_partition_mib must be at least 34: {}",
                self.seed_partition_mib
            ));
        }

        Ok(())
    }
}

fn is_three_octets(prefix: &str) -> bool {
    let parts: Vec<&str> = prefix.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.parse::<u8>().is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_paths_layout() {
        let paths = StatePaths::under_home(Path::new("/home/op"));

        assert_eq!(paths.keys_dir(), PathBuf::from("/home/op/.syntropy/keys"));
        assert_eq!(paths.nodes_dir(), PathBuf::from("/home/op/.syntropy/nodes"));
        assert_eq!(paths.iso_cache_dir(), PathBuf::from("/home/op/.syntropy/cache/iso"));
        assert_eq!(paths.config_file(), PathBuf::from("/home/op/.syntropy/config.yaml"));
        assert_eq!(paths.default_work_root(false), PathBuf::from("/home/op/.syntropy/work"));
    }

    #[test]
    fn test_state_paths_env_precedence() {
        let paths = StatePaths::from_lookup(|key| match key {
            "HOME" => Some("/home/op".to_string()),
            "USERPROFILE" => Some("C:\\Users\\op".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(paths.root(), Path::new("/home/op/.syntropy"));

        let windows = StatePaths::from_lookup(|key| match key {
            "USERPROFILE" => Some("/mnt/c/Users/op".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(windows.root(), Path::new("/mnt/c/Users/op/.syntropy"));

        assert!(StatePaths::from_lookup(|_| None).is_none());
    }

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.timeouts.download_secs, 1800);
        assert_eq!(settings.timeouts.raw_write_secs, 1800);
        assert_eq!(settings.timeouts.device_op_secs, 30);
    }

    #[test]
    fn test_seed_defaults_validation() {
        let mut seed = SeedDefaults::default();
        seed.nameservers = vec!["not-an-ip".to_string()];
        assert!(seed.validate().is_err());

        let mut seed = SeedDefaults::default();
        seed.mesh_prefix = "10.42".to_string();
        assert!(seed.validate().is_err());

        let mut seed = SeedDefaults::default();
        seed.mgmt_vlan_id = 0;
        assert!(seed.validate().is_err());

        let mut seed = SeedDefaults::default();
        seed.seed_partition_mib = 16;
        assert!(seed.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut settings = Settings::default();
        settings.timeouts.raw_write_secs = 0;
        assert!(settings.validate().is_err());
    }
}
