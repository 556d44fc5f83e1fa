// file: src/identity/fingerprint.rs
// version: 1.1.0
// guid: 4c2f8a91-7e3b-45d6-b0a8-1f9e6d3c5b27

//! Stable key fingerprints and the on-disk fingerprint record

use super::KeyAlgorithm;
use sha2::{Digest, Sha256};
use ssh_key::public::KeyData;
use ssh_key::PublicKey;

/// Hex SHA-256 over the authorized_keys line, surrounding whitespace ignored
pub fn fingerprint_public_line(line: &str) -> String {
    hex::encode(Sha256::digest(line.trim().as_bytes()))
}

/// Algorithm of an OpenSSH public key line; RSA size comes from the modulus
pub fn algorithm_from_public_line(line: &str) -> Option<KeyAlgorithm> {
    let key = PublicKey::from_openssh(line.trim()).ok()?;
    match key.key_data() {
        KeyData::Ed25519(_) => Some(KeyAlgorithm::Ed25519),
        KeyData::Rsa(rsa) => {
            let modulus = rsa.n.as_positive_bytes()?;
            let first = *modulus.first()?;
            Some(KeyAlgorithm::Rsa((modulus.len() as u32 - 1) * 8 + (8 - first.leading_zeros())))
        }
        _ => None,
    }
}

/// `"<sha256> <algorithm> <filename>\n"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintRecord {
    pub sha256: String,
    pub algorithm: KeyAlgorithm,
    /// Public key file the fingerprint was taken from
    pub file_name: String,
}

impl FingerprintRecord {
    pub fn render(&self) -> String {
        format!("{} {} {}\n", self.sha256, self.algorithm, self.file_name)
    }

    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        let [sha256, algorithm, file_name] = fields.as_slice() else {
            return Err(format!("expected 3 fields, found {}", fields.len()));
        };
        if sha256.len() != 64 || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("not a SHA-256 digest: {}", sha256));
        }
        Ok(Self {
            sha256: sha256.to_ascii_lowercase(),
            algorithm: algorithm.parse()?,
            file_name: file_name.to_string(),
        })
    }
}
