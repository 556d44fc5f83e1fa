// file: src/utils/system.rs
// version: 2.0.0
// guid: w3x4y5z6-a7b8-9012-3456-789012wxyzab

//! System utility functions

use tracing::debug;

/// System utility functions
pub struct SystemUtils;

impl SystemUtils {
    /// Check if a command exists in PATH
    pub fn command_exists(command: &str) -> bool {
        let found = which::which(command).is_ok();
        debug!("command {} available: {}", command, found);
        found
    }

    /// Report which of `commands` are missing from PATH
    pub fn missing_commands<'a>(commands: &[&'a str]) -> Vec<&'a str> {
        commands
            .iter()
            .copied()
            .filter(|cmd| !Self::command_exists(cmd))
            .collect()
    }

    /// Check if running as root
    pub fn is_root() -> bool {
        #[cfg(unix)]
        {
            unsafe { libc::getuid() == 0 }
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Operator name from `USER` / `USERNAME`
    pub fn operator_name() -> String {
        Self::operator_name_from(|key| std::env::var(key).ok())
    }

    pub(crate) fn operator_name_from(lookup: impl Fn(&str) -> Option<String>) -> String {
        ["USER", "USERNAME"]
            .iter()
            .filter_map(|key| lookup(key))
            .find(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }
}
