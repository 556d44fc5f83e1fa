// file: tests/identity_store_test.rs
// version: 1.0.0
// guid: 6d2a9f14-5b83-4e07-8c1d-a4e7b3f90c25

//! On-disk layout of the operator identity store

use std::sync::Arc;
use syntropy_provision::identity::fake::{FakeKeygen, FakeTls};
use syntropy_provision::identity::{fingerprint_public_line, IdentityManager, IdentityStore, Purpose};
use tempfile::TempDir;

fn manager(dir: &std::path::Path) -> IdentityManager {
    IdentityManager::new(IdentityStore::new(dir), Arc::new(FakeKeygen::new()), Arc::new(FakeTls))
}

#[tokio::test]
async fn test_layout_and_fingerprint_files() {
    let dir = TempDir::new().unwrap();
    let identities = manager(dir.path());

    let resolved = identities.ensure_identity("node-01", None).await.unwrap();

    for purpose in Purpose::ALL {
        let stem = format!("node-01-{}", purpose);
        let public = std::fs::read_to_string(dir.path().join(format!("{}.key.pub", stem))).unwrap();
        let record = std::fs::read_to_string(dir.path().join(format!("{}.fingerprint", stem))).unwrap();
        let fields: Vec<&str> = record.split_whitespace().collect();

        assert!(record.ends_with('\n'));
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0], fingerprint_public_line(&public));
        assert_eq!(fields[0], resolved.identity.keypair(purpose).fingerprint);
        assert_eq!(fields[1], "ed25519");
        assert_eq!(fields[2], format!("{}.key.pub", stem));
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_modes_are_enforced() {
    use std::os::unix::fs::PermissionsExt;
    let dir = TempDir::new().unwrap();
    manager(dir.path()).ensure_identity("node-01", None).await.unwrap();

    let mode = |name: &str| std::fs::metadata(dir.path().join(name)).unwrap().permissions().mode() & 0o777;

    assert_eq!(mode("node-01-owner.key"), 0o600);
    assert_eq!(mode("node-01-owner.key.pub"), 0o644);
    assert_eq!(mode("node-01-owner.fingerprint"), 0o644);
}

#[tokio::test]
async fn test_listing_and_delete() {
    let dir = TempDir::new().unwrap();
    let identities = manager(dir.path());
    identities.ensure_identity("node-01", None).await.unwrap();
    identities.ensure_identity("node-02", None).await.unwrap();
    let store = identities.store();

    let listed = store.list_private_keys().unwrap();
    assert_eq!(listed.len(), 6);
    assert!(listed.iter().all(|n| n.ends_with(".key")));
    assert_eq!(store.nodes().unwrap(), vec!["node-01", "node-02"]);

    let removed = store.delete("node-01").unwrap();

    assert_eq!(removed.len(), 9);
    assert_eq!(store.nodes().unwrap(), vec!["node-02"]);
    for purpose in Purpose::ALL {
        assert!(store.read("node-01", purpose).unwrap().is_none());
    }
}

#[tokio::test]
async fn test_concurrent_resolution_creates_one_identity() {
    let dir = TempDir::new().unwrap();
    let identities = Arc::new(manager(dir.path()));

    let (a, b) = tokio::join!(
        identities.ensure_identity("node-01", None),
        identities.ensure_identity("node-01", None)
    );

    assert_eq!(a.unwrap().identity.fingerprints(), b.unwrap().identity.fingerprints());
}
