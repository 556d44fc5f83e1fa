// file: src/image/mod.rs
// version: 2.0.0
// guid: f1e2d3c4-b5a6-7890-1234-567890fedcba

//! Ubuntu Server install image resolution and caching

pub mod cache;
pub mod download;
pub mod fake;
pub mod releases;

pub use cache::IsoCache;
pub use download::{NetworkDownloader, ReleaseFetcher};
pub use releases::{ReleaseCandidate, RELEASES};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Anything at or below this is a truncated download, not a server ISO
pub const MIN_IMAGE_BYTES: u64 = 500 * 1024 * 1024;

/// `size_bytes > 500 MiB`
pub fn is_plausible_image_size(size_bytes: u64) -> bool {
    size_bytes > MIN_IMAGE_BYTES
}

/// A verified install image on local disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallImage {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Release URL, or a `file://` URL for operator-supplied images
    pub source_url: String,
    pub verified_at: DateTime<Utc>,
}

/// Why no install image could be produced
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageFailure {
    #[error("no candidate release URL was reachable")]
    NoCandidateReachable,

    #[error("download of {url} ended at {size_bytes} bytes")]
    DownloadTruncated { url: String, size_bytes: u64 },

    #[error("download of {url} did not finish within {secs}s")]
    DownloadTimedOut { url: String, secs: u64 },

    #[error("{path} is only {size_bytes} bytes")]
    TooSmall { path: PathBuf, size_bytes: u64 },

    #[error("{0}")]
    IoFailed(String),
}

impl ImageFailure {
    pub(crate) fn io(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        ImageFailure::IoFailed(format!("{}: {}", context, err))
    }
}
