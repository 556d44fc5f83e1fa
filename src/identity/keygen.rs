// file: src/identity/keygen.rs
// version: 2.0.0
// guid: 71c5e2a8-9f04-4b6d-8e3a-2d7b1c9f0e56

//! SSH keypair generation in OpenSSH format

use super::KeyAlgorithm;
use crate::error::ProvisionError;
use crate::Result;
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use ssh_key::private::{Ed25519Keypair, KeypairData, RsaKeypair};
use ssh_key::{LineEnding, PrivateKey, PublicKey};
use std::path::Path;

/// Fresh key material before it is fingerprinted and stored
#[derive(Clone)]
pub struct GeneratedKey {
    pub algorithm: KeyAlgorithm,
    pub private_pem: String,
    pub public_line: String,
}

/// Produces SSH keypairs
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    async fn generate(&self, algorithm: KeyAlgorithm, comment: &str) -> Result<GeneratedKey>;

    /// Public authorized_keys line for an existing private key file
    async fn derive_public(&self, private_key: &Path) -> Result<String>;
}

/// Generates keys in-process from the OS random source
#[derive(Debug, Clone, Copy, Default)]
pub struct SshKeyGenerator;

impl SshKeyGenerator {
    pub fn new() -> Self {
        Self
    }
}

fn key_error(context: &str, err: impl std::fmt::Display) -> ProvisionError {
    ProvisionError::identity(format!("{}: {}", context, err))
}

/// Blocking; RSA generation takes seconds
fn generate_blocking(algorithm: KeyAlgorithm, comment: &str) -> Result<GeneratedKey> {
    let data = match algorithm {
        KeyAlgorithm::Ed25519 => {
            let signing = SigningKey::generate(&mut OsRng);
            KeypairData::from(Ed25519Keypair::from_seed(&signing.to_bytes()))
        }
        KeyAlgorithm::Rsa(bits) => KeypairData::from(
            RsaKeypair::random(&mut OsRng, bits as usize)
                .map_err(|e| key_error("rsa generation failed", e))?,
        ),
    };
    let private = PrivateKey::new(data, comment).map_err(|e| key_error("invalid keypair", e))?;
    let private_pem = private
        .to_openssh(LineEnding::LF)
        .map_err(|e| key_error("cannot encode private key", e))?
        .to_string();
    Ok(GeneratedKey {
        algorithm,
        private_pem,
        public_line: public_line_of(&private)?,
    })
}

fn public_line_of(private: &PrivateKey) -> Result<String> {
    PublicKey::new(private.public_key().key_data().clone(), private.comment())
        .to_openssh()
        .map_err(|e| key_error("cannot encode public key", e))
}

#[async_trait]
impl KeyGenerator for SshKeyGenerator {
    async fn generate(&self, algorithm: KeyAlgorithm, comment: &str) -> Result<GeneratedKey> {
        let comment = comment.to_string();
        tokio::task::spawn_blocking(move || generate_blocking(algorithm, &comment))
            .await
            .map_err(|e| key_error("key generation task failed", e))?
    }

    async fn derive_public(&self, private_key: &Path) -> Result<String> {
        let text = tokio::fs::read_to_string(private_key).await.map_err(|e| {
            key_error(&format!("cannot read {}", private_key.display()), e)
        })?;
        // The public half of an OpenSSH key is stored unencrypted
        let private = PrivateKey::from_openssh(&text).map_err(|e| {
            key_error(
                &format!("{} is not an OpenSSH private key (supply a .pub next to it)", private_key.display()),
                e,
            )
        })?;
        public_line_of(&private)
    }
}
