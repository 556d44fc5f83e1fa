// file: src/record/mod.rs
// version: 1.0.0
// guid: 9c5e2f18-4d7a-4b03-a6e1-8f2d0b7c3a94

//! Fleet records under `~/.syntropy/nodes/<node>.json`

use crate::error::ProvisionError;
use crate::identity::Fingerprints;
use crate::utils::{atomic_write_async, FileLock, FileMode};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const STATUS_PROVISIONED: &str = "provisioned";

/// Where the node's material lives on the workstation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPaths {
    pub identity_dir: PathBuf,
}

/// Post-provision descriptor of one node
///
/// Fields are declared in key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub description: String,
    pub fingerprints: Fingerprints,
    pub name: String,
    pub paths: RecordPaths,
    pub status: String,
}

impl NodeRecord {
    pub fn provisioned(
        name: impl Into<String>,
        description: impl Into<String>,
        created_by: impl Into<String>,
        fingerprints: Fingerprints,
        identity_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            created_at: Utc::now(),
            created_by: created_by.into(),
            description: description.into(),
            fingerprints,
            name: name.into(),
            paths: RecordPaths {
                identity_dir: identity_dir.into(),
            },
            status: STATUS_PROVISIONED.to_string(),
        }
    }

    /// Pretty JSON with keys sorted at every level
    pub fn to_json(&self) -> Result<String> {
        // serde_json::Map is ordered by key
        let value = serde_json::to_value(self)?;
        let mut text = serde_json::to_string_pretty(&value)?;
        text.push('\n');
        Ok(text)
    }
}

/// Writes one record per node name, atomically
#[derive(Debug, Clone)]
pub struct NodeRecordWriter {
    dir: PathBuf,
}

impl NodeRecordWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// Persist `record`; an existing record is replaced only with `overwrite`
    pub async fn write(&self, record: &NodeRecord, overwrite: bool) -> Result<PathBuf> {
        let _lock = FileLock::acquire(self.dir.join(format!(".{}.lock", record.name))).await?;
        let path = self.path(&record.name);

        if !overwrite && tokio::fs::try_exists(&path).await? {
            return Err(ProvisionError::RecordExists(record.name.clone()));
        }

        atomic_write_async(&path, record.to_json()?.into_bytes(), FileMode::Public).await?;
        info!("Wrote node record {}", path.display());
        Ok(path)
    }

    pub async fn read(&self, name: &str) -> Result<Option<NodeRecord>> {
        match tokio::fs::read_to_string(self.path(name)).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All records, sorted by name; unreadable files are skipped
    pub async fn list(&self) -> Result<Vec<NodeRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read_to_string(&path)
                .await
                .map_err(ProvisionError::from)
                .and_then(|text| serde_json::from_str::<NodeRecord>(&text).map_err(Into::into));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => debug!("Skipping {}: {}", path.display(), e),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}
