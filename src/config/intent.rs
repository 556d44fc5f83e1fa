// file: src/config/intent.rs
// version: 1.0.0
// guid: d2c8141b-f8b7-44fb-82fa-d3c042f2b7f4

//! Provisioning intent: the operator's "create a node" request
//!
//! [`IntentRequest`] is the raw, unvalidated input. [`ProvisionIntent::validate`]
//! is pure: it touches neither the filesystem nor the environment, and reports
//! every violated field at once.

use crate::error::ProvisionError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Default FAT volume label recorded for the media
pub const DEFAULT_LABEL: &str = "SYNTROPY";

/// Default discovery service the node agent registers with
pub const DEFAULT_DISCOVERY_ENDPOINT: &str = "discovery.syntropy.network";

pub const NODE_NAME_MIN: usize = 3;
pub const NODE_NAME_MAX: usize = 50;
const DESCRIPTION_MAX: usize = 256;
const COORDINATES_MAX: usize = 64;
const CREATED_BY_MAX: usize = 64;
const LABEL_MAX: usize = 11;

/// One rejected field and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub reason: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// How the target device is chosen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSelector {
    /// Enumerate and pick the single valid candidate
    Auto,
    /// Use exactly this device
    Explicit(PathBuf),
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Auto => write!(f, "auto"),
            DeviceSelector::Explicit(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Raw request as assembled by the CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentRequest {
    pub node_name: String,
    pub description: Option<String>,
    pub coordinates: Option<String>,
    pub label: Option<String>,
    pub discovery_endpoint: Option<String>,
    pub iso_path: Option<PathBuf>,
    /// `"auto"` or a device path
    pub device: Option<String>,
    pub created_by: Option<String>,
    pub owner_key_ref: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
}

impl IntentRequest {
    /// Request for `node_name` with automatic device detection
    pub fn auto(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            device: Some("auto".to_string()),
            ..Default::default()
        }
    }
}

/// Values filled in for fields the operator left out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentDefaults {
    pub created_by: String,
    pub work_dir: PathBuf,
    pub cache_dir: PathBuf,
}

/// Validated, immutable provisioning intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionIntent {
    node_name: String,
    description: String,
    coordinates: String,
    label: String,
    discovery_endpoint: String,
    iso_path: Option<PathBuf>,
    device_selector: DeviceSelector,
    created_by: String,
    owner_key_ref: Option<PathBuf>,
    work_dir: PathBuf,
    cache_dir: PathBuf,
}

impl ProvisionIntent {
    /// Validate a request, collecting every violation
    pub fn validate(request: &IntentRequest, defaults: &IntentDefaults) -> Result<Self> {
        let mut violations = Vec::new();

        violations.extend(check_node_name(&request.node_name));

        let description = request.description.clone().unwrap_or_default();
        if description.chars().count() > DESCRIPTION_MAX {
            violations.push(FieldViolation::new(
                "description",
                format!("must be at most {} characters", DESCRIPTION_MAX),
            ));
        }
        if has_control_chars(&description) {
            violations.push(FieldViolation::new(
                "description",
                "must not contain control characters",
            ));
        }

        let coordinates = request.coordinates.clone().unwrap_or_default();
        violations.extend(check_coordinates(&coordinates));

        let label = request
            .label
            .clone()
            .unwrap_or_else(|| DEFAULT_LABEL.to_string());
        violations.extend(check_label(&label));

        let discovery_endpoint = request
            .discovery_endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_DISCOVERY_ENDPOINT.to_string());
        if !is_dns_name(&discovery_endpoint) {
            violations.push(FieldViolation::new(
                "discovery_endpoint",
                format!("not a valid DNS name: {:?}", discovery_endpoint),
            ));
        }

        if let Some(iso) = &request.iso_path {
            if iso.as_os_str().is_empty() {
                violations.push(FieldViolation::new("iso_path", "must not be empty"));
            }
        }

        let device_selector = match request.device.as_deref().map(str::trim) {
            None | Some("") => {
                violations.push(FieldViolation::new(
                    "device_selector",
                    "pass a device path or --auto-detect",
                ));
                DeviceSelector::Auto
            }
            Some(s) if s.eq_ignore_ascii_case("auto") => DeviceSelector::Auto,
            Some(s) => {
                if !is_device_path(s) {
                    violations.push(FieldViolation::new(
                        "device_selector",
                        format!("not a device path: {:?}", s),
                    ));
                }
                DeviceSelector::Explicit(PathBuf::from(s))
            }
        };

        let created_by = request
            .created_by
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| defaults.created_by.clone());
        if created_by.chars().count() > CREATED_BY_MAX || has_control_chars(&created_by) {
            violations.push(FieldViolation::new(
                "created_by",
                format!("must be at most {} printable characters", CREATED_BY_MAX),
            ));
        }

        if let Some(owner) = &request.owner_key_ref {
            if owner.as_os_str().is_empty() {
                violations.push(FieldViolation::new("owner_key_ref", "must not be empty"));
            }
        }

        let work_dir = non_empty_or(&request.work_dir, &defaults.work_dir);
        let cache_dir = non_empty_or(&request.cache_dir, &defaults.cache_dir);

        if !violations.is_empty() {
            return Err(ProvisionError::InvalidIntent(violations));
        }

        Ok(Self {
            node_name: request.node_name.clone(),
            description,
            coordinates,
            label,
            discovery_endpoint,
            iso_path: request.iso_path.clone(),
            device_selector,
            created_by,
            owner_key_ref: request.owner_key_ref.clone(),
            work_dir,
            cache_dir,
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn coordinates(&self) -> &str {
        &self.coordinates
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn discovery_endpoint(&self) -> &str {
        &self.discovery_endpoint
    }

    pub fn iso_path(&self) -> Option<&Path> {
        self.iso_path.as_deref()
    }

    pub fn device_selector(&self) -> &DeviceSelector {
        &self.device_selector
    }

    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    pub fn owner_key_ref(&self) -> Option<&Path> {
        self.owner_key_ref.as_deref()
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

/// Node names become file names, hostnames and record keys
pub fn check_node_name(name: &str) -> Vec<FieldViolation> {
    let mut violations = Vec::new();
    let len = name.chars().count();
    if !(NODE_NAME_MIN..=NODE_NAME_MAX).contains(&len) {
        violations.push(FieldViolation::new(
            "node_name",
            format!(
                "length {} outside {}..={}",
                len, NODE_NAME_MIN, NODE_NAME_MAX
            ),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        violations.push(FieldViolation::new(
            "node_name",
            "only letters, digits, '_' and '-' are allowed",
        ));
    }
    violations
}

fn check_coordinates(coordinates: &str) -> Vec<FieldViolation> {
    let mut violations = Vec::new();
    if coordinates.chars().count() > COORDINATES_MAX || has_control_chars(coordinates) {
        violations.push(FieldViolation::new(
            "coordinates",
            format!("must be at most {} printable characters", COORDINATES_MAX),
        ));
        return violations;
    }

    // Free text, but a "lat,lon" pair must be in range
    let parts: Vec<&str> = coordinates.split(',').map(str::trim).collect();
    if let [lat, lon] = parts.as_slice() {
        if let (Ok(lat), Ok(lon)) = (lat.parse::<f64>(), lon.parse::<f64>()) {
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                violations.push(FieldViolation::new(
                    "coordinates",
                    format!("latitude/longitude out of range: {}", coordinates),
                ));
            }
        }
    }
    violations
}

pub fn check_label(label: &str) -> Vec<FieldViolation> {
    let valid = !label.is_empty()
        && label.len() <= LABEL_MAX
        && label
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Vec::new()
    } else {
        vec![FieldViolation::new(
            "label",
            format!(
                "FAT32 labels are 1..={} characters of A-Z, 0-9, '_' or '-': {:?}",
                LABEL_MAX, label
            ),
        )]
    }
}

/// RFC 1123 host name
pub fn is_dns_name(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

fn is_device_path(s: &str) -> bool {
    s.starts_with("/dev/") || s.to_ascii_uppercase().starts_with(r"\\.\PHYSICALDRIVE")
}

fn has_control_chars(s: &str) -> bool {
    s.chars().any(char::is_control)
}

fn non_empty_or(value: &Option<PathBuf>, default: &Path) -> PathBuf {
    value
        .clone()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| default.to_path_buf())
}
