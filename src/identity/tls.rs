// file: src/identity/tls.rs
// version: 2.0.0
// guid: 5f8d3a62-1e7c-4a09-b4f2-9c6e0d8a3b71

//! Per-session TLS bundle: a self-signed CA and one node certificate

use super::TlsBundle;
use crate::error::ProvisionError;
use crate::utils::{atomic_write, FileMode};
use crate::Result;
use async_trait::async_trait;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use std::path::Path;
use tracing::info;

pub const CA_VALIDITY_DAYS: u32 = 3650;
pub const NODE_VALIDITY_DAYS: u32 = 365;

/// Produces TLS bundles into a directory
#[async_trait]
pub trait TlsGenerator: Send + Sync {
    async fn generate(&self, node_name: &str, out_dir: &Path) -> Result<TlsBundle>;
}

/// Subject alternative names of the node certificate
pub fn node_subject_alt_names(node_name: &str) -> Vec<String> {
    vec![
        node_name.to_string(),
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ]
}

/// In-process certificate authority
#[derive(Debug, Clone, Copy, Default)]
pub struct RcgenTls;

impl RcgenTls {
    pub fn new() -> Self {
        Self
    }
}

fn tls_error(context: &str, err: impl std::fmt::Display) -> ProvisionError {
    ProvisionError::identity(format!("{}: {}", context, err))
}

fn validity(params: &mut CertificateParams, days: u32) -> Result<()> {
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now
        .checked_add(time::Duration::days(i64::from(days)))
        .ok_or_else(|| ProvisionError::identity("certificate validity overflows"))?;
    Ok(())
}

fn common_name(name: String) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(name));
    dn
}

fn issue_ca(node_name: &str) -> Result<(Certificate, KeyPair)> {
    let mut params = CertificateParams::default();
    params.distinguished_name = common_name(format!("{} Syntropy CA", node_name));
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    validity(&mut params, CA_VALIDITY_DAYS)?;

    let key = KeyPair::generate().map_err(|e| tls_error("ca key generation failed", e))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| tls_error("ca self-signing failed", e))?;
    Ok((cert, key))
}

fn issue_node(node_name: &str, ca: &Certificate, ca_key: &KeyPair) -> Result<(Certificate, KeyPair)> {
    let mut params = CertificateParams::new(node_subject_alt_names(node_name))
        .map_err(|e| tls_error("invalid node name for a certificate", e))?;
    params.distinguished_name = common_name(node_name.to_string());
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    validity(&mut params, NODE_VALIDITY_DAYS)?;

    let key = KeyPair::generate().map_err(|e| tls_error("node key generation failed", e))?;
    let cert = params
        .signed_by(&key, ca, ca_key)
        .map_err(|e| tls_error("node certificate signing failed", e))?;
    Ok((cert, key))
}

#[async_trait]
impl TlsGenerator for RcgenTls {
    async fn generate(&self, node_name: &str, out_dir: &Path) -> Result<TlsBundle> {
        let name = node_name.to_string();
        let ((ca, ca_key), (node, node_key)) = tokio::task::spawn_blocking(move || {
            let ca = issue_ca(&name)?;
            let node = issue_node(&name, &ca.0, &ca.1)?;
            Ok::<_, ProvisionError>((ca, node))
        })
        .await
        .map_err(|e| tls_error("certificate task failed", e))??;

        let bundle = TlsBundle {
            ca_cert: ca.pem(),
            ca_key: ca_key.serialize_pem(),
            node_cert: node.pem(),
            node_key: node_key.serialize_pem(),
            dir: out_dir.to_path_buf(),
        };

        tokio::fs::create_dir_all(out_dir).await?;
        atomic_write(&out_dir.join("ca.crt"), bundle.ca_cert.as_bytes(), FileMode::Public)?;
        atomic_write(&out_dir.join("ca.key"), bundle.ca_key.as_bytes(), FileMode::Private)?;
        atomic_write(&out_dir.join("node.crt"), bundle.node_cert.as_bytes(), FileMode::Public)?;
        atomic_write(&out_dir.join("node.key"), bundle.node_key.as_bytes(), FileMode::Private)?;

        info!("Generated session TLS bundle for {} in {}", node_name, out_dir.display());
        Ok(bundle)
    }
}
