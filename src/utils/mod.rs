// file: src/utils/mod.rs
// version: 2.0.0
// guid: v2w3x4y5-z6a7-8901-2345-678901vwxyza

//! Utility modules for filesystem and system operations

pub mod fs;
pub mod lock;
pub mod system;

pub use fs::{atomic_write, atomic_write_async, set_mode, FileMode};
pub use lock::FileLock;
pub use system::SystemUtils;

/// Human-readable size using binary units
pub fn format_size(size_bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = size_bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", size_bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
