// file: src/pipeline/session.rs
// version: 1.0.0
// guid: 7d4a9e26-0f3b-4c81-b5e7-2a6c8d1f9e04

//! Session work directory and its `session.json` phase journal

use super::phase::Phase;
use super::tracker::DeviceState;
use crate::config::intent::ProvisionIntent;
use crate::error::{OperatorReport, ProvisionError};
use crate::identity::Fingerprints;
use crate::platform::{HostKind, TargetDevice};
use crate::utils::{atomic_write, FileMode};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

pub const JOURNAL_FILE: &str = "session.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Running,
    Succeeded,
    Failed,
}

/// Everything known about one provisioning attempt
#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningSession {
    pub session_id: Uuid,
    pub host: HostKind,
    pub started_at: DateTime<Utc>,
    pub intent: ProvisionIntent,
    pub phase: Phase,
    pub completed: Vec<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chosen_device: Option<TargetDevice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chosen_image: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_snapshot: Option<Fingerprints>,
    pub device_states: Vec<DeviceState>,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<OperatorReport>,
    #[serde(skip)]
    work_dir: PathBuf,
}

impl ProvisioningSession {
    /// Create `<work_dir>/<node>-<session8>` for a validated intent
    pub fn start(intent: ProvisionIntent, host: HostKind) -> Result<Self> {
        let session_id = Uuid::new_v4();
        let short = session_id.simple().to_string();
        let work_dir = intent
            .work_dir()
            .join(format!("{}-{}", intent.node_name(), &short[..8]));
        std::fs::create_dir_all(&work_dir)?;

        let session = Self {
            session_id,
            host,
            started_at: Utc::now(),
            intent,
            phase: Phase::ValidateIntent,
            completed: vec![Phase::ValidateIntent],
            chosen_device: None,
            chosen_image: None,
            identity_snapshot: None,
            device_states: Vec::new(),
            outcome: Outcome::Running,
            failure: None,
            work_dir,
        };
        session.save();
        info!("Session {} working in {}", session.session_id, session.work_dir.display());
        Ok(session)
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn seed_dir(&self) -> PathBuf {
        self.work_dir.join("seed")
    }

    pub fn tls_dir(&self) -> PathBuf {
        self.work_dir.join("tls")
    }

    pub fn mount_dir(&self) -> PathBuf {
        self.work_dir.join("mnt")
    }

    pub fn begin(&mut self, phase: Phase) {
        self.phase = phase;
        info!("[{}/{}] {}", phase.step(), Phase::TOTAL, phase);
        self.save();
    }

    pub fn complete(&mut self, phase: Phase) {
        if !self.completed.contains(&phase) {
            self.completed.push(phase);
        }
        self.save();
    }

    pub fn fail(&mut self, report: OperatorReport) {
        self.outcome = Outcome::Failed;
        self.failure = Some(report);
        self.save();
    }

    pub fn succeed(&mut self) {
        self.outcome = Outcome::Succeeded;
        self.save();
    }

    /// Remove the work directory after a successful run
    pub fn cleanup(&self) {
        match std::fs::remove_dir_all(&self.work_dir) {
            Ok(()) => info!("Removed work directory {}", self.work_dir.display()),
            Err(e) => warn!("Could not remove {}: {}", self.work_dir.display(), e),
        }
    }

    /// Journal writes are best effort; the session outcome never depends on them
    fn save(&self) {
        let result = serde_json::to_vec_pretty(self)
            .map_err(ProvisionError::from)
            .and_then(|bytes| {
                atomic_write(&self.work_dir.join(JOURNAL_FILE), &bytes, FileMode::Private)
            });
        if let Err(e) = result {
            warn!("Could not update session journal: {}", e);
        }
    }
}
