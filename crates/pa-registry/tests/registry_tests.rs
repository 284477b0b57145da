//! PrincipalRegistry Integration Tests
//!
//! Tests for:
//! - Snapshot save and restore
//! - Concurrent membership updates

use std::sync::Arc;

use pa_common::{Group, PermissionRule, Principal};
use pa_registry::{PrincipalRegistry, RegistryError};

fn populated() -> PrincipalRegistry {
    let registry = PrincipalRegistry::new();
    registry
        .put_group(Group::new("EC2UserGroup").with_rule(PermissionRule::new(["ec2:*"], ["*"])))
        .unwrap();
    registry.upsert(Principal::new("ec2User").with_initial_secret_version("v1")).unwrap();
    registry.add_to_group("ec2User", "EC2UserGroup").unwrap();
    registry.set_metadata("ec2User", "a@x.com").unwrap();
    registry
}

#[tokio::test]
async fn test_snapshot_round_trip_preserves_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("registry.json");

    let registry = populated();
    registry.save_snapshot(&path).await.unwrap();

    let restored = PrincipalRegistry::load_snapshot(&path).await.unwrap();
    assert_eq!(restored.snapshot(), registry.snapshot());

    let principal = restored.get("ec2User").unwrap();
    assert_eq!(principal.contact_email.as_deref(), Some("a@x.com"));
    assert_eq!(principal.initial_secret_version.as_deref(), Some("v1"));
    assert!(restored.is_allowed("ec2User", "ec2:RunInstances", "*").unwrap());
}

#[tokio::test]
async fn test_missing_snapshot_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let registry = PrincipalRegistry::load_snapshot(&dir.path().join("absent.json")).await.unwrap();
    assert!(registry.list().is_empty());
}

#[tokio::test]
async fn test_corrupt_snapshot_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.json");
    tokio::fs::write(&path, b"{ not json").await.unwrap();

    assert!(matches!(
        PrincipalRegistry::load_snapshot(&path).await,
        Err(RegistryError::Serialization(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_membership_updates() {
    let registry = Arc::new(PrincipalRegistry::new());
    for i in 0..8 {
        registry.put_group(Group::new(format!("group-{}", i))).unwrap();
    }
    registry.upsert(Principal::new("ec2User")).unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..10 {
                registry.add_to_group("ec2User", &format!("group-{}", i)).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(registry.get("ec2User").unwrap().group_names.len(), 8);
}
