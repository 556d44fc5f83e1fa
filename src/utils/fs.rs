// file: src/utils/fs.rs
// version: 1.0.0
// guid: fbaa857a-e73f-46a7-a946-b57211a28ce1

//! Atomic, mode-enforcing file writes
//!
//! Every mutation of operator state goes through [`atomic_write`]: the bytes land
//! in a temporary sibling, are flushed and given their final mode, then renamed
//! over the destination. Readers never observe a truncated file.

use crate::Result;
use std::io::Write;
use std::path::Path;

/// File modes used across the operator state tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// 0600, private key material
    Private,
    /// 0644, public material and records
    Public,
}

impl FileMode {
    pub fn bits(self) -> u32 {
        match self {
            FileMode::Private => 0o600,
            FileMode::Public => 0o644,
        }
    }
}

/// Set a file's permission bits (no-op off Unix)
pub fn set_mode(path: &Path, mode: FileMode) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode.bits()))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

/// Write `contents` to `path` atomically (temp + fsync + rename) with `mode`
pub fn atomic_write(path: &Path, contents: &[u8], mode: FileMode) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    set_mode(temp.path(), mode)?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Async wrapper around [`atomic_write`]
pub async fn atomic_write_async(
    path: impl AsRef<Path>,
    contents: Vec<u8>,
    mode: FileMode,
) -> Result<()> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || atomic_write(&path, &contents, mode))
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}
