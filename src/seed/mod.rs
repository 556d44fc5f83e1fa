// file: src/seed/mod.rs
// version: 1.0.0
// guid: 3e91d0b4-57a2-4c6f-8b18-e4a0c2f96d35

//! NoCloud seed rendering: `user-data`, `meta-data` and `network-config`
//!
//! Templates ship inside the binary. The substitution set is closed (see
//! [`template::DECLARED`]); free-text values are emitted as quoted scalars and
//! PEM material as base64, and every rendered file must parse back as YAML.

pub mod template;

use crate::config::intent::ProvisionIntent;
use crate::config::SeedDefaults;
use crate::error::ProvisionError;
use crate::identity::{Identity, TlsBundle};
use crate::utils::{atomic_write, FileMode};
use crate::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use template::Values;
use tracing::debug;

pub const USER_DATA: &str = "user-data";
pub const META_DATA: &str = "meta-data";
pub const NETWORK_CONFIG: &str = "network-config";

const USER_DATA_TEMPLATE: &str = include_str!("templates/user-data.yaml");
const META_DATA_TEMPLATE: &str = include_str!("templates/meta-data.yaml");
const NETWORK_CONFIG_TEMPLATE: &str = include_str!("templates/network-config.yaml");

/// Templates bundled with this build, by seed file name
pub const TEMPLATES: [(&str, &str); 3] = [
    (USER_DATA, USER_DATA_TEMPLATE),
    (META_DATA, META_DATA_TEMPLATE),
    (NETWORK_CONFIG, NETWORK_CONFIG_TEMPLATE),
];

/// Paths on the node where the TLS bundle lands
const NODE_TLS_DIR: &str = "/etc/syntropy/tls";

/// Rendered seed files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedBundle {
    pub user_data: String,
    pub meta_data: String,
    pub network_config: String,
}

impl SeedBundle {
    pub fn files(&self) -> [(&'static str, &str); 3] {
        [
            (USER_DATA, &self.user_data),
            (META_DATA, &self.meta_data),
            (NETWORK_CONFIG, &self.network_config),
        ]
    }

    /// Write the three files into `dir`; `user-data` carries key material and is 0600
    pub fn write_to(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::with_capacity(3);
        for (name, contents) in self.files() {
            let path = dir.join(name);
            let mode = if name == USER_DATA {
                FileMode::Private
            } else {
                FileMode::Public
            };
            atomic_write(&path, contents.as_bytes(), mode)?;
            written.push(path);
        }
        debug!("Wrote seed files to {}", dir.display());
        Ok(written)
    }
}

/// Per-session values not taken from the intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedDerived {
    pub instance_id: String,
    pub created_at: DateTime<Utc>,
    /// Host octet of the mesh and management addresses
    pub ip_suffix: u8,
}

impl SeedDerived {
    pub fn new(node_name: &str) -> Self {
        let created_at = Utc::now();
        Self {
            instance_id: instance_id(node_name, created_at),
            created_at,
            ip_suffix: rand::thread_rng().gen_range(2..=255),
        }
    }
}

/// Time-ordered, unique per invocation
pub fn instance_id(node_name: &str, at: DateTime<Utc>) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "syntropy-{}-{}-{}",
        node_name.to_ascii_lowercase(),
        at.format("%Y%m%dT%H%M%S%3fZ"),
        &nonce[..8]
    )
}

/// Agent configuration written to `/etc/syntropy/agent.yaml` on the node
#[derive(Debug, Serialize)]
struct AgentConfig<'a> {
    node_name: &'a str,
    description: &'a str,
    coordinates: &'a str,
    discovery_endpoint: &'a str,
    mesh_address: &'a str,
    mgmt_address: &'a str,
    tls: AgentTls,
    fingerprints: crate::identity::Fingerprints,
}

#[derive(Debug, Serialize)]
struct AgentTls {
    ca_cert: String,
    cert: String,
    key: String,
}

/// Renders the seed from an intent, an identity and session values
#[derive(Debug, Clone)]
pub struct SeedRenderer {
    defaults: SeedDefaults,
}

impl SeedRenderer {
    pub fn new(defaults: SeedDefaults) -> Self {
        Self { defaults }
    }

    pub fn render(
        &self,
        intent: &ProvisionIntent,
        identity: &Identity,
        tls: &TlsBundle,
        derived: &SeedDerived,
    ) -> Result<SeedBundle> {
        let values = self.values(intent, identity, tls, derived)?;
        render_values(&values)
    }

    /// Bind every declared variable
    pub fn values(
        &self,
        intent: &ProvisionIntent,
        identity: &Identity,
        tls: &TlsBundle,
        derived: &SeedDerived,
    ) -> Result<Values> {
        if derived.ip_suffix < 2 {
            return Err(ProvisionError::render(format!(
                "ip suffix {} outside [2,255]",
                derived.ip_suffix
            )));
        }
        let d = &self.defaults;
        let mesh_address = format!("{}.{}/24", d.mesh_prefix, derived.ip_suffix);
        let mgmt_address = format!("{}.{}/24", d.mgmt_prefix, derived.ip_suffix);
        let fingerprints = identity.fingerprints();

        let agent = AgentConfig {
            node_name: intent.node_name(),
            description: intent.description(),
            coordinates: intent.coordinates(),
            discovery_endpoint: intent.discovery_endpoint(),
            mesh_address: &mesh_address,
            mgmt_address: &mgmt_address,
            tls: AgentTls {
                ca_cert: format!("{}/ca.crt", NODE_TLS_DIR),
                cert: format!("{}/node.crt", NODE_TLS_DIR),
                key: format!("{}/node.key", NODE_TLS_DIR),
            },
            fingerprints: fingerprints.clone(),
        };
        let agent_yaml = serde_yaml::to_string(&agent)?;

        let mut v = Values::new();
        v.insert("hostname", quoted(&hostname(intent.node_name())));
        v.insert("node_name", quoted(intent.node_name()));
        v.insert("description", quoted(intent.description()));
        v.insert("coordinates", quoted(intent.coordinates()));
        v.insert("locale", quoted(&d.locale));
        v.insert("timezone", quoted(&d.timezone));
        v.insert("instance_id", quoted(&derived.instance_id));
        v.insert(
            "created_at",
            quoted(&derived.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        v.insert("created_by", quoted(intent.created_by()));
        v.insert("media_label", quoted(intent.label()));
        v.insert("discovery_endpoint", quoted(intent.discovery_endpoint()));
        v.insert("owner_fingerprint", quoted(&fingerprints.owner));
        v.insert("community_fingerprint", quoted(&fingerprints.community));
        v.insert("node_fingerprint", quoted(&fingerprints.node));
        v.insert("node_public_key", quoted(identity.node.public_line.trim()));
        v.insert("tls_ca_cert_b64", b64(&tls.ca_cert));
        v.insert("tls_node_cert_b64", b64(&tls.node_cert));
        v.insert("tls_node_key_b64", b64(&tls.node_key));
        v.insert("agent_config_b64", b64(&agent_yaml));
        v.insert("interface_name", quoted(&d.interface_name));
        v.insert("ip_suffix", derived.ip_suffix.to_string());
        v.insert("mesh_address", quoted(&mesh_address));
        v.insert("mgmt_vlan_id", d.mgmt_vlan_id.to_string());
        v.insert("mgmt_address", quoted(&mgmt_address));
        v.insert("gateway", quoted(&d.gateway));
        v.insert("nameservers", serde_json::to_string(&d.nameservers)?);
        Ok(v)
    }
}

/// Render all templates from bound values and parse each result back
pub fn render_values(values: &Values) -> Result<SeedBundle> {
    let mut rendered = Vec::with_capacity(TEMPLATES.len());
    for (name, text) in TEMPLATES {
        let out = template::render(name, text, values)?;
        check_yaml(name, &out)?;
        rendered.push(out);
    }
    let [user_data, meta_data, network_config]: [String; 3] = rendered
        .try_into()
        .map_err(|_| ProvisionError::render("template set changed size"))?;
    Ok(SeedBundle {
        user_data,
        meta_data,
        network_config,
    })
}

fn check_yaml(name: &str, text: &str) -> Result<()> {
    let value: serde_yaml::Value = serde_yaml::from_str(text)
        .map_err(|e| ProvisionError::render(format!("{} is not valid YAML: {}", name, e)))?;
    if !value.is_mapping() {
        return Err(ProvisionError::render(format!(
            "{} does not render to a YAML mapping",
            name
        )));
    }
    Ok(())
}

/// Double-quoted scalar; JSON strings are valid YAML
fn quoted(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}

fn b64(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

/// Node names may carry `_`, which is not legal in a hostname
pub fn hostname(node_name: &str) -> String {
    node_name.to_ascii_lowercase().replace('_', "-")
}
