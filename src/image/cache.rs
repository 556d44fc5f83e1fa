// file: src/image/cache.rs
// version: 1.1.0
// guid: a1a2a3a4-b5b6-7890-1234-567890abcdef

//! ISO cache: reuse, probe, download and atomic promotion of release images

use super::download::ReleaseFetcher;
use super::releases::{ReleaseCandidate, RELEASES};
use super::{is_plausible_image_size, ImageFailure, InstallImage};
use crate::error::ProvisionError;
use crate::utils::{format_size, FileLock};
use crate::Result;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

const LOCK_FILE: &str = ".lock";
const PARTIAL_SUFFIX: &str = ".tmp";

fn unavailable(failure: ImageFailure) -> ProvisionError {
    ProvisionError::ImageUnavailable(failure)
}

/// A `.tmp` download, unlinked on drop unless promoted.
///
/// Dropping covers failures as well as a canceled resolution whose future
/// is discarded mid-transfer.
struct PartialDownload {
    path: PathBuf,
    promoted: bool,
}

impl PartialDownload {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            promoted: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn promote(mut self, to: &Path) -> Result<()> {
        fs::rename(&self.path, to)
            .await
            .map_err(|e| unavailable(ImageFailure::io(to.display(), e)))?;
        self.promoted = true;
        Ok(())
    }
}

impl Drop for PartialDownload {
    fn drop(&mut self) {
        if !self.promoted {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!("Removed partial download {}", self.path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Cannot remove {}: {}", self.path.display(), e),
            }
        }
    }
}

/// Release image cache under `~/.syntropy/cache/iso`
pub struct IsoCache {
    dir: PathBuf,
    fetcher: Arc<dyn ReleaseFetcher>,
    candidates: Vec<ReleaseCandidate>,
    download_timeout: Duration,
}

impl IsoCache {
    pub fn new(dir: impl Into<PathBuf>, fetcher: Arc<dyn ReleaseFetcher>, download_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            fetcher,
            candidates: RELEASES.to_vec(),
            download_timeout,
        }
    }

    /// Replace the ranked candidate list
    pub fn with_candidates(mut self, candidates: Vec<ReleaseCandidate>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolve an install image.
    ///
    /// An explicit path is validated and returned without network access.
    /// Otherwise the cache is consulted in rank order and, on a miss, the
    /// first reachable candidate is downloaded.
    pub async fn ensure_image(&self, explicit: Option<&Path>) -> Result<InstallImage> {
        if let Some(path) = explicit {
            return self.explicit_image(path).await;
        }

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| unavailable(ImageFailure::io(self.dir.display(), e)))?;
        let _lock = FileLock::acquire(self.dir.join(LOCK_FILE)).await?;

        self.remove_partials().await;

        for candidate in &self.candidates {
            let path = self.dir.join(candidate.file_name());
            let Ok(meta) = fs::metadata(&path).await else {
                continue;
            };
            if is_plausible_image_size(meta.len()) {
                info!("Using cached image {} ({})", path.display(), format_size(meta.len()));
                return Ok(InstallImage {
                    path,
                    size_bytes: meta.len(),
                    source_url: candidate.url.to_string(),
                    verified_at: Utc::now(),
                });
            }
            warn!(
                "Discarding cached {} at {} bytes",
                path.display(),
                meta.len()
            );
            fs::remove_file(&path)
                .await
                .map_err(|e| unavailable(ImageFailure::io(path.display(), e)))?;
        }

        for candidate in &self.candidates {
            if !self.fetcher.probe(candidate.url).await {
                warn!("Release {} unreachable: {}", candidate.version, candidate.url);
                continue;
            }
            return self.download(candidate).await;
        }

        Err(unavailable(ImageFailure::NoCandidateReachable))
    }

    async fn explicit_image(&self, path: &Path) -> Result<InstallImage> {
        let meta = fs::metadata(path)
            .await
            .map_err(|e| unavailable(ImageFailure::io(path.display(), e)))?;
        if !is_plausible_image_size(meta.len()) {
            return Err(unavailable(ImageFailure::TooSmall {
                path: path.to_path_buf(),
                size_bytes: meta.len(),
            }));
        }

        let absolute = fs::canonicalize(path).await.unwrap_or_else(|_| path.to_path_buf());
        let source_url = url::Url::from_file_path(&absolute)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| absolute.display().to_string());
        info!("Using operator-supplied image {}", absolute.display());
        Ok(InstallImage {
            path: absolute,
            size_bytes: meta.len(),
            source_url,
            verified_at: Utc::now(),
        })
    }

    async fn download(&self, candidate: &ReleaseCandidate) -> Result<InstallImage> {
        let final_path = self.dir.join(candidate.file_name());
        let partial = PartialDownload::new(
            self.dir
                .join(format!("{}{}", candidate.file_name(), PARTIAL_SUFFIX)),
        );

        let outcome = tokio::time::timeout(
            self.download_timeout,
            self.fetcher.fetch(candidate.url, partial.path()),
        )
        .await;
        match outcome {
            Err(_) => {
                return Err(unavailable(ImageFailure::DownloadTimedOut {
                    url: candidate.url.to_string(),
                    secs: self.download_timeout.as_secs(),
                }))
            }
            Ok(Err(e)) => return Err(unavailable(ImageFailure::io(candidate.url, e))),
            Ok(Ok(_)) => {}
        }

        let size = fs::metadata(partial.path())
            .await
            .map_err(|e| unavailable(ImageFailure::io(partial.path().display(), e)))?
            .len();
        if !is_plausible_image_size(size) {
            return Err(unavailable(ImageFailure::DownloadTruncated {
                url: candidate.url.to_string(),
                size_bytes: size,
            }));
        }

        partial.promote(&final_path).await?;
        info!("Cached {} ({})", final_path.display(), format_size(size));

        Ok(InstallImage {
            path: final_path,
            size_bytes: size,
            source_url: candidate.url.to_string(),
            verified_at: Utc::now(),
        })
    }

    async fn remove_partials(&self) {
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(PARTIAL_SUFFIX) {
                warn!("Removing partial download {}", name);
                let _ = fs::remove_file(entry.path()).await;
            }
        }
    }

    /// Images currently in the cache, valid or not
    pub async fn cached(&self) -> Result<Vec<InstallImage>> {
        let mut images = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(images),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".iso") {
                continue;
            }
            let meta = entry.metadata().await?;
            let source_url = self
                .candidates
                .iter()
                .find(|c| c.file_name() == name)
                .map(|c| c.url.to_string())
                .unwrap_or_default();
            images.push(InstallImage {
                path: entry.path(),
                size_bytes: meta.len(),
                source_url,
                verified_at: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
            });
        }
        images.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::MIN_IMAGE_BYTES;
    use crate::image::fake::FakeFetcher;
    use tempfile::TempDir;

    const A: ReleaseCandidate = ReleaseCandidate {
        codename: "noble",
        version: "24.04.9",
        url: "https://mirror.invalid/a/ubuntu-a.iso",
    };
    const B: ReleaseCandidate = ReleaseCandidate {
        codename: "jammy",
        version: "22.04.9",
        url: "https://mirror.invalid/b/ubuntu-b.iso",
    };

    fn stub(reachable: Vec<&'static str>, size: u64) -> Arc<FakeFetcher> {
        Arc::new(FakeFetcher::new(reachable, size))
    }

    fn sparse(path: &Path, size: u64) {
        std::fs::File::create(path).unwrap().set_len(size).unwrap();
    }

    fn cache(dir: &Path, fetcher: Arc<FakeFetcher>) -> IsoCache {
        IsoCache::new(dir, fetcher, Duration::from_secs(5)).with_candidates(vec![A, B])
    }

    #[tokio::test]
    async fn test_reuses_cached_image() {
        let dir = TempDir::new().unwrap();
        sparse(&dir.path().join("ubuntu-b.iso"), 2100 * 1024 * 1024);
        let fetcher = stub(vec![], 0);

        let image = cache(dir.path(), fetcher.clone()).ensure_image(None).await.unwrap();

        assert_eq!(image.path, dir.path().join("ubuntu-b.iso"));
        assert!(fetcher.fetched().is_empty());
    }

    #[tokio::test]
    async fn test_cached_at_threshold_is_replaced() {
        let dir = TempDir::new().unwrap();
        sparse(&dir.path().join("ubuntu-a.iso"), MIN_IMAGE_BYTES);
        let fetcher = stub(vec![A.url], MIN_IMAGE_BYTES + 1);

        let image = cache(dir.path(), fetcher.clone()).ensure_image(None).await.unwrap();

        assert_eq!(image.size_bytes, MIN_IMAGE_BYTES + 1);
        assert_eq!(fetcher.fetched().len(), 1);
    }

    #[tokio::test]
    async fn test_first_unreachable_falls_through() {
        let dir = TempDir::new().unwrap();
        let fetcher = stub(vec![B.url], MIN_IMAGE_BYTES + 4096);

        let image = cache(dir.path(), fetcher).ensure_image(None).await.unwrap();

        assert_eq!(image.path, dir.path().join("ubuntu-b.iso"));
        assert_eq!(image.source_url, B.url);
        assert!(!dir.path().join("ubuntu-b.iso.tmp").exists());
    }

    #[tokio::test]
    async fn test_nothing_reachable() {
        let dir = TempDir::new().unwrap();
        let fetcher = stub(vec![], 0);

        let err = cache(dir.path(), fetcher).ensure_image(None).await.unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::ImageUnavailable(ImageFailure::NoCandidateReachable)
        ));
        assert_eq!(err.exit_code(), 5);
    }

    #[tokio::test]
    async fn test_truncated_download_is_unlinked() {
        let dir = TempDir::new().unwrap();
        let fetcher = stub(vec![A.url], 1024);

        let err = cache(dir.path(), fetcher).ensure_image(None).await.unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::ImageUnavailable(ImageFailure::DownloadTruncated { .. })
        ));
        assert!(!dir.path().join("ubuntu-a.iso.tmp").exists());
        assert!(!dir.path().join("ubuntu-a.iso").exists());
    }

    #[tokio::test]
    async fn test_download_timeout_removes_partial() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(
            FakeFetcher::new(vec![A.url], MIN_IMAGE_BYTES + 1).with_delay(Duration::from_secs(30)),
        );
        let cache = IsoCache::new(dir.path(), fetcher, Duration::from_millis(50)).with_candidates(vec![A]);

        let err = cache.ensure_image(None).await.unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::ImageUnavailable(ImageFailure::DownloadTimedOut { .. })
        ));
        assert!(!dir.path().join("ubuntu-a.iso.tmp").exists());
    }

    #[tokio::test]
    async fn test_abandoned_download_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(
            FakeFetcher::new(vec![A.url], MIN_IMAGE_BYTES + 1).with_delay(Duration::from_secs(30)),
        );
        let cache = cache(dir.path(), fetcher.clone());

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), cache.ensure_image(None)).await;

        assert!(abandoned.is_err());
        assert_eq!(fetcher.fetched(), vec![A.url.to_string()]);
        assert!(!dir.path().join("ubuntu-a.iso.tmp").exists());
        assert!(!dir.path().join("ubuntu-a.iso").exists());
    }

    #[tokio::test]
    async fn test_explicit_path_skips_network() {
        let dir = TempDir::new().unwrap();
        let iso = dir.path().join("custom.iso");
        sparse(&iso, MIN_IMAGE_BYTES + 1);
        let fetcher = stub(vec![A.url], MIN_IMAGE_BYTES + 1);

        let image = cache(&dir.path().join("cache"), fetcher.clone())
            .ensure_image(Some(&iso))
            .await
            .unwrap();

        assert!(image.source_url.starts_with("file://"));
        assert!(fetcher.fetched().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_path_at_threshold_rejected() {
        let dir = TempDir::new().unwrap();
        let iso = dir.path().join("small.iso");
        sparse(&iso, MIN_IMAGE_BYTES);

        let err = cache(dir.path(), stub(vec![], 0))
            .ensure_image(Some(&iso))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::ImageUnavailable(ImageFailure::TooSmall { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_partials_removed() {
        let dir = TempDir::new().unwrap();
        sparse(&dir.path().join("ubuntu-a.iso.tmp"), 10);
        sparse(&dir.path().join("ubuntu-b.iso"), MIN_IMAGE_BYTES + 1);

        cache(dir.path(), stub(vec![], 0))
            .ensure_image(None)
            .await
            .unwrap();

        assert!(!dir.path().join("ubuntu-a.iso.tmp").exists());
    }

    #[tokio::test]
    async fn test_concurrent_sessions_download_once() {
        let dir = TempDir::new().unwrap();
        let fetcher = stub(vec![A.url], MIN_IMAGE_BYTES + 1);
        let first = cache(dir.path(), fetcher.clone());
        let second = cache(dir.path(), fetcher.clone());

        let (a, b) = tokio::join!(first.ensure_image(None), second.ensure_image(None));

        assert_eq!(a.unwrap().path, b.unwrap().path);
        assert_eq!(fetcher.fetched().len(), 1);
    }

    #[tokio::test]
    async fn test_cached_listing() {
        let dir = TempDir::new().unwrap();
        sparse(&dir.path().join("ubuntu-a.iso"), 42);
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let images = cache(dir.path(), stub(vec![], 0)).cached().await.unwrap();

        assert_eq!(images.len(), 1);
        assert_eq!(images[0].size_bytes, 42);
        assert_eq!(images[0].source_url, A.url);
    }
}
