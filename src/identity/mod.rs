// file: src/identity/mod.rs
// version: 1.0.0
// guid: 8e4a1f6c-2b9d-4c37-a5e0-7d3f9b2c6a18

//! Per-node identities: SSH keypairs, fingerprints and session TLS bundles

pub mod fake;
pub mod fingerprint;
pub mod keygen;
pub mod manager;
pub mod store;
pub mod tls;

pub use fingerprint::{fingerprint_public_line, FingerprintRecord};
pub use keygen::{GeneratedKey, KeyGenerator, SshKeyGenerator};
pub use manager::{IdentityManager, KeyOrigin, ResolvedIdentity};
pub use store::IdentityStore;
pub use tls::{RcgenTls, TlsGenerator};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Role a keypair plays for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Owner,
    Community,
    Node,
}

impl Purpose {
    pub const ALL: [Purpose; 3] = [Purpose::Owner, Purpose::Community, Purpose::Node];

    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Owner => "owner",
            Purpose::Community => "community",
            Purpose::Node => "node",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key algorithm as recorded in the fingerprint file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    Ed25519,
    Rsa(u32),
}

impl KeyAlgorithm {
    /// RSA size used when Ed25519 generation fails
    pub const RSA_FALLBACK_BITS: u32 = 2048;
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Ed25519 => f.write_str("ed25519"),
            KeyAlgorithm::Rsa(bits) => write!(f, "rsa-{}", bits),
        }
    }
}

impl FromStr for KeyAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "ed25519" {
            return Ok(KeyAlgorithm::Ed25519);
        }
        s.strip_prefix("rsa-")
            .and_then(|bits| bits.parse().ok())
            .map(KeyAlgorithm::Rsa)
            .ok_or_else(|| format!("unknown key algorithm: {}", s))
    }
}

impl Serialize for KeyAlgorithm {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// One keypair of a node identity
#[derive(Clone, PartialEq, Eq)]
pub struct Keypair {
    /// `<node>-<purpose>`
    pub id: String,
    pub purpose: Purpose,
    pub algorithm: KeyAlgorithm,
    pub private_pem: String,
    /// OpenSSH authorized_keys line
    pub public_line: String,
    /// Hex SHA-256 of the trimmed public line
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("id", &self.id)
            .field("purpose", &self.purpose)
            .field("algorithm", &self.algorithm)
            .field("fingerprint", &self.fingerprint)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Owner, community and node keypairs for one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub node_name: String,
    pub owner: Keypair,
    pub community: Keypair,
    pub node: Keypair,
}

/// Fingerprints of an identity, as persisted in node records and meta-data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprints {
    pub owner: String,
    pub community: String,
    pub node: String,
}

impl Identity {
    pub fn keypair(&self, purpose: Purpose) -> &Keypair {
        match purpose {
            Purpose::Owner => &self.owner,
            Purpose::Community => &self.community,
            Purpose::Node => &self.node,
        }
    }

    pub fn fingerprints(&self) -> Fingerprints {
        Fingerprints {
            owner: self.owner.fingerprint.clone(),
            community: self.community.fingerprint.clone(),
            node: self.node.fingerprint.clone(),
        }
    }
}

/// Session TLS material: a CA and the node certificate it signed
#[derive(Clone, PartialEq, Eq)]
pub struct TlsBundle {
    pub ca_cert: String,
    pub ca_key: String,
    pub node_cert: String,
    pub node_key: String,
    /// Session directory holding the PEM files
    pub dir: PathBuf,
}

impl fmt::Debug for TlsBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsBundle")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}
