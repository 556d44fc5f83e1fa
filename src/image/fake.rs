// file: src/image/fake.rs
// version: 1.1.0
// guid: 0c6e3a58-2f91-47b4-8d1a-e5b9c3f07a62

//! Offline release source producing sparse image files

use super::download::ReleaseFetcher;
use crate::error::ProvisionError;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Answers probes from a fixed set and "downloads" sparse files of a given size
#[derive(Debug)]
pub struct FakeFetcher {
    reachable: HashSet<String>,
    size_bytes: u64,
    delay: Option<Duration>,
    fetched: Mutex<Vec<String>>,
}

impl FakeFetcher {
    /// Every URL in `reachable` answers; fetched files are `size_bytes` long
    pub fn new<I, S>(reachable: I, size_bytes: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reachable: reachable.into_iter().map(Into::into).collect(),
            size_bytes,
            delay: None,
            fetched: Mutex::new(Vec::new()),
        }
    }

    /// Nothing answers
    pub fn offline() -> Self {
        Self::new(Vec::<String>::new(), 0)
    }

    /// Stall each fetch after the destination file exists
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// URLs fetched so far, in order
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ReleaseFetcher for FakeFetcher {
    async fn probe(&self, url: &str) -> bool {
        self.reachable.contains(url)
    }

    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        if !self.reachable.contains(url) {
            return Err(ProvisionError::network(format!("{} unreachable", url)));
        }
        if let Ok(mut fetched) = self.fetched.lock() {
            fetched.push(url.to_string());
        }
        let file = tokio::fs::File::create(dest).await?;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        file.set_len(self.size_bytes).await?;
        file.sync_all().await?;
        Ok(self.size_bytes)
    }
}
