// file: src/error.rs
// version: 3.1.0
// guid: 57b83a63-07b6-4534-aa6c-51e8797254e0

//! Error taxonomy for the provisioning pipeline.
//!
//! Every kind carries a human message and a machine-readable code; the CLI maps
//! kinds to process exit codes and never shows a backtrace to the operator.

use crate::config::intent::FieldViolation;
use crate::image::ImageFailure;
use crate::platform::{RejectReason, Subphase, TargetDevice};
use serde::Serialize;
use thiserror::Error;

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Error kinds surfaced by the provisioning core
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("invalid provisioning intent: {}", join_violations(.0))]
    InvalidIntent(Vec<FieldViolation>),

    #[error("no usable device: {0}")]
    NoDevice(String),

    #[error("{} candidate devices match, pass an explicit device: {}", .0.len(), summarize_devices(.0))]
    AmbiguousDevice(Vec<TargetDevice>),

    #[error("device {device} rejected: {reason}")]
    DeviceRejected { device: String, reason: RejectReason },

    #[error("install image unavailable: {0}")]
    ImageUnavailable(ImageFailure),

    #[error("identity failure: {0}")]
    IdentityFailure(String),

    #[error("seed render failure: {0}")]
    RenderFailure(String),

    #[error("{subphase} failed: {message}")]
    PlatformFailure { subphase: Subphase, message: String },

    #[error("{subphase} timed out after {secs}s")]
    Timeout { subphase: Subphase, secs: u64 },

    #[error("canceled before {0}")]
    Canceled(String),

    #[error("unsupported on this host: {0}")]
    Unsupported(String),

    #[error("required host tools not found in PATH: {}", .0.join(", "))]
    MissingTools(Vec<String>),

    #[error("{primary}; device release also failed: {release}")]
    ReleaseFailed {
        primary: Box<ProvisionError>,
        release: Box<ProvisionError>,
    },

    #[error("node record for {0} already exists")]
    RecordExists(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<reqwest::Error> for ProvisionError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl ProvisionError {
    /// Create a host adapter failure for a subphase
    pub fn platform(subphase: Subphase, msg: impl Into<String>) -> Self {
        Self::PlatformFailure {
            subphase,
            message: msg.into(),
        }
    }

    /// Create a new identity error
    pub fn identity(msg: impl Into<String>) -> Self {
        Self::IdentityFailure(msg.into())
    }

    /// Create a new render error
    pub fn render(msg: impl Into<String>) -> Self {
        Self::RenderFailure(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a new unsupported-operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a new cancellation error naming where it was honored
    pub fn canceled(at: impl Into<String>) -> Self {
        Self::Canceled(at.into())
    }

    /// Machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidIntent(_) => "INVALID_INTENT",
            Self::NoDevice(_) => "NO_DEVICE",
            Self::AmbiguousDevice(_) => "AMBIGUOUS_DEVICE",
            Self::DeviceRejected { .. } => "DEVICE_REJECTED",
            Self::ImageUnavailable(_) => "IMAGE_UNAVAILABLE",
            Self::IdentityFailure(_) => "IDENTITY_FAILURE",
            Self::RenderFailure(_) => "RENDER_FAILURE",
            Self::PlatformFailure { .. } => "PLATFORM_FAILURE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Canceled(_) => "CANCELED",
            Self::Unsupported(_) => "UNSUPPORTED",
            Self::MissingTools(_) => "MISSING_TOOLS",
            Self::ReleaseFailed { .. } => "RELEASE_FAILED",
            Self::RecordExists(_) => "RECORD_EXISTS",
            Self::Config(_) => "CONFIG",
            Self::Network(_) => "NETWORK",
            Self::Io(_) => "IO",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Yaml(_) => "YAML",
        }
    }

    /// Process exit code for the `syntropy` binary
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidIntent(_) => 2,
            Self::NoDevice(_) | Self::AmbiguousDevice(_) => 3,
            Self::DeviceRejected { .. } => 4,
            Self::ImageUnavailable(_) => 5,
            Self::IdentityFailure(_) => 6,
            Self::PlatformFailure { .. }
            | Self::Timeout { .. }
            | Self::Unsupported(_)
            | Self::MissingTools(_)
            | Self::ReleaseFailed { .. } => 7,
            _ => 1,
        }
    }

    /// Host subphase the failure belongs to, if any
    pub fn subphase(&self) -> Option<Subphase> {
        match self {
            Self::PlatformFailure { subphase, .. } | Self::Timeout { subphase, .. } => {
                Some(*subphase)
            }
            Self::ReleaseFailed { primary, release } => {
                primary.subphase().or_else(|| release.subphase())
            }
            _ => None,
        }
    }

    /// What the operator can do about it
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::InvalidIntent(_) => "fix the listed fields and reissue the command",
            Self::NoDevice(_) => "insert a removable USB device between 1 GiB and 2 TiB",
            Self::AmbiguousDevice(_) => "pass one of the listed devices explicitly",
            Self::DeviceRejected { .. } => "choose a removable device that holds no system or boot partition",
            Self::ImageUnavailable(_) => "check network access or pass --iso with a local Ubuntu Server image",
            Self::IdentityFailure(_) => "inspect ~/.syntropy/keys; a corrupt key is moved aside as *.corrupt-<timestamp>",
            Self::RenderFailure(_) => "this is a defect in the seed templates; report it",
            Self::PlatformFailure { .. } | Self::Timeout { .. } | Self::ReleaseFailed { .. } => {
                "the media is not bootable; inspect the retained work directory and reissue the command"
            }
            Self::Canceled(_) => "reissue the command when ready",
            Self::Unsupported(_) => "run the provisioning from Linux or WSL",
            Self::MissingTools(_) => "install the listed tools (gdisk, parted, dosfstools) and check `syntropy debug`",
            Self::RecordExists(_) => "re-provision the node to overwrite its record",
            Self::Config(_) => "check ~/.syntropy/config.yaml",
            Self::Network(_) => "check network connectivity",
            Self::Io(_) | Self::Serialization(_) | Self::Yaml(_) => {
                "check permissions and free space under ~/.syntropy"
            }
        }
    }

    /// Operator-facing rendering of the error
    pub fn report(&self) -> OperatorReport {
        OperatorReport {
            code: self.code().to_string(),
            phase: None,
            subphase: self.subphase().map(|s| s.to_string()),
            message: self.to_string(),
            suggestion: self.suggestion().to_string(),
            exit_code: self.exit_code(),
        }
    }
}

/// What the operator sees instead of a stack trace
#[derive(Debug, Clone, Serialize)]
pub struct OperatorReport {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subphase: Option<String>,
    pub message: String,
    pub suggestion: String,
    pub exit_code: i32,
}

impl From<ProvisionError> for OperatorReport {
    fn from(err: ProvisionError) -> Self {
        err.report()
    }
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn summarize_devices(devices: &[TargetDevice]) -> String {
    devices
        .iter()
        .map(TargetDevice::summary)
        .collect::<Vec<_>>()
        .join("; ")
}
