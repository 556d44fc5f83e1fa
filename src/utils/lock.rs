// file: src/utils/lock.rs
// version: 1.0.0
// guid: 42a40b5a-a692-4293-b39f-813fe939f1e9

//! Advisory file locks serializing access to shared operator state
//!
//! The lock is released when the guard is dropped, on every exit path.
//! `flock` locks belong to the open file description, so two tasks in the
//! same process that open the lock file separately still exclude each other.

use crate::Result;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Held exclusive lock on a lock file
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    /// Block (off the async executor) until the lock at `path` is ours
    pub async fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock_path = path.clone();
        let file = tokio::task::spawn_blocking(move || lock_exclusive(&lock_path))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;

        debug!("Acquired lock {}", path.display());
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Lock an already-open file, e.g. a block device node
    pub fn from_file(path: impl AsRef<Path>, file: File) -> Result<Self> {
        flock_exclusive(&file)?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            unlock(&file);
            debug!("Released lock {}", self.path.display());
        }
    }
}

fn lock_exclusive(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    flock_exclusive(&file)?;
    Ok(file)
}

#[cfg(unix)]
fn flock_exclusive(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    let _ = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
}

// Advisory locks are Unix-only; Windows-native hosts never reach the destructive phases.
#[cfg(not(unix))]
fn flock_exclusive(_file: &File) -> Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lock_creates_file_and_releases() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locks").join("node-01.lock");

        {
            let lock = FileLock::acquire(&path).await.unwrap();
            assert_eq!(lock.path(), path.as_path());
            assert!(path.exists());
        }

        // Reacquire after drop must not block
        let _again = FileLock::acquire(&path).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lock_serializes_holders() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.lock");
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let path = path.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _lock = FileLock::acquire(&path).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
