// file: src/image/releases.rs
// version: 1.0.0
// guid: 3b7e9d20-5a41-4c8f-9d62-0e1f4a7b8c93

//! Ranked Ubuntu Server LTS releases, newest first
//!
//! The list ships with the binary; a new release means a new build.

/// One downloadable release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseCandidate {
    pub codename: &'static str,
    pub version: &'static str,
    pub url: &'static str,
}

impl ReleaseCandidate {
    /// Cache file name, the last URL segment
    pub fn file_name(&self) -> &'static str {
        self.url.rsplit('/').next().unwrap_or(self.url)
    }
}

pub const RELEASES: &[ReleaseCandidate] = &[
    ReleaseCandidate {
        codename: "noble",
        version: "24.04.3",
        url: "https://releases.ubuntu.com/24.04.3/ubuntu-24.04.3-live-server-amd64.iso",
    },
    ReleaseCandidate {
        codename: "noble",
        version: "24.04.2",
        url: "https://old-releases.ubuntu.com/releases/24.04.2/ubuntu-24.04.2-live-server-amd64.iso",
    },
    ReleaseCandidate {
        codename: "jammy",
        version: "22.04.5",
        url: "https://releases.ubuntu.com/22.04.5/ubuntu-22.04.5-live-server-amd64.iso",
    },
];
