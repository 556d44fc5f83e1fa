// file: src/pipeline/tracker.rs
// version: 1.0.0
// guid: c8f1a3e7-5b20-4d96-8e4c-17a9d2b0f653

//! Per-device state machine for one session
//!
//! ```text
//! idle -> offline -> raw_mounted -> image_written -> partitioned -> formatted -> seeded -> online
//! ```
//!
//! Any state may move to `online` (the cleanup path), exactly once.

use crate::error::ProvisionError;
use crate::platform::Subphase;
use crate::Result;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Idle,
    Offline,
    RawMounted,
    ImageWritten,
    Partitioned,
    Formatted,
    Seeded,
    Online,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Idle => "idle",
            DeviceState::Offline => "offline",
            DeviceState::RawMounted => "raw_mounted",
            DeviceState::ImageWritten => "image_written",
            DeviceState::Partitioned => "partitioned",
            DeviceState::Formatted => "formatted",
            DeviceState::Seeded => "seeded",
            DeviceState::Online => "online",
        }
    }

    fn next(&self) -> Option<DeviceState> {
        match self {
            DeviceState::Idle => Some(DeviceState::Offline),
            DeviceState::Offline => Some(DeviceState::RawMounted),
            DeviceState::RawMounted => Some(DeviceState::ImageWritten),
            DeviceState::ImageWritten => Some(DeviceState::Partitioned),
            DeviceState::Partitioned => Some(DeviceState::Formatted),
            DeviceState::Formatted => Some(DeviceState::Seeded),
            DeviceState::Seeded => Some(DeviceState::Online),
            DeviceState::Online => None,
        }
    }

    /// Subphase that drives the transition into this state
    fn subphase(&self) -> Subphase {
        match self {
            DeviceState::Idle | DeviceState::Offline => Subphase::Offline,
            DeviceState::RawMounted => Subphase::Mount,
            DeviceState::ImageWritten => Subphase::Write,
            DeviceState::Partitioned => Subphase::Partition,
            DeviceState::Formatted => Subphase::Format,
            DeviceState::Seeded => Subphase::Copy,
            DeviceState::Online => Subphase::Online,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct DeviceTracker {
    history: Vec<DeviceState>,
}

impl Default for DeviceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTracker {
    pub fn new() -> Self {
        Self {
            history: vec![DeviceState::Idle],
        }
    }

    pub fn state(&self) -> DeviceState {
        self.history.last().copied().unwrap_or(DeviceState::Idle)
    }

    pub fn history(&self) -> &[DeviceState] {
        &self.history
    }

    /// Move to `to`; anything off the documented graph is a defect
    pub fn advance(&mut self, to: DeviceState) -> Result<()> {
        let from = self.state();
        let legal = from.next() == Some(to) || (to == DeviceState::Online && from != DeviceState::Online);
        if !legal {
            return Err(ProvisionError::platform(
                to.subphase(),
                format!("illegal device transition {} -> {}", from, to),
            ));
        }
        self.history.push(to);
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.state() == DeviceState::Online
    }
}
