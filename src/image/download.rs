// file: src/image/download.rs
// version: 2.0.0
// guid: u1v2w3x4-y5z6-7890-1234-567890uvwxyz

//! Release downloads with progress tracking

use crate::error::ProvisionError;
use crate::Result;
use async_trait::async_trait;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Source of release images
#[async_trait]
pub trait ReleaseFetcher: Send + Sync {
    /// Metadata probe; `true` when the URL answers successfully
    async fn probe(&self, url: &str) -> bool;

    /// Stream `url` into `dest`, flushed to disk, returning the byte count
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// HTTP downloader with progress bar
pub struct NetworkDownloader {
    client: reqwest::Client,
    show_progress: bool,
}

impl NetworkDownloader {
    /// Create a new network downloader
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            show_progress: true,
        }
    }

    /// Suppress the progress bar (quiet or JSON logging)
    pub fn without_progress(mut self) -> Self {
        self.show_progress = false;
        self
    }

    fn progress_bar(&self, total: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total);
        let style = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
        pb.set_style(style);
        pb
    }
}

impl Default for NetworkDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReleaseFetcher for NetworkDownloader {
    async fn probe(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            Ok(response) => {
                debug!("HEAD {} -> {}", url, response.status());
                response.status().is_success()
            }
            Err(e) => {
                debug!("HEAD {} failed: {}", url, e);
                false
            }
        }
    }

    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        info!("Downloading: {}", url);

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ProvisionError::network(format!(
                "Download failed with status: {}",
                response.status()
            )));
        }

        let pb = self.progress_bar(response.content_length().unwrap_or(0));
        let mut file = File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            pb.set_position(downloaded);
        }

        file.flush().await?;
        file.sync_all().await?;
        pb.finish_with_message("Download completed");

        info!("Downloaded {} bytes to {}", downloaded, dest.display());
        Ok(downloaded)
    }
}
