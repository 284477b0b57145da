//! SecretVault Integration Tests
//!
//! Tests for:
//! - Single-writer generation under concurrent callers
//! - Version retrieval through the encrypted file store
//! - Store failures surfacing through the vault

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use pa_secrets::{
    EncryptedFileStore, EnsureOutcome, MemoryStore, RotationPolicy, SecretPolicy, SecretStore,
    SecretVault, SecretsError, StoredVersion, generate_key,
};

/// Store wrapper counting writes
struct CountingStore {
    inner: MemoryStore,
    writes: AtomicU32,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            writes: AtomicU32::new(0),
        }
    }

    fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for CountingStore {
    async fn put_version(&self, secret_id: &str, value: &str) -> Result<StoredVersion, SecretsError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        // Widen the race window
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        self.inner.put_version(secret_id, value).await
    }

    async fn get_version(&self, secret_id: &str, version: Option<&str>) -> Result<StoredVersion, SecretsError> {
        self.inner.get_version(secret_id, version).await
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Store that refuses every write
struct ReadOnlyStore;

#[async_trait]
impl SecretStore for ReadOnlyStore {
    async fn put_version(&self, _secret_id: &str, _value: &str) -> Result<StoredVersion, SecretsError> {
        Err(SecretsError::ProviderError("store is read-only".to_string()))
    }

    async fn get_version(&self, secret_id: &str, version: Option<&str>) -> Result<StoredVersion, SecretsError> {
        Err(SecretsError::not_found(secret_id, version))
    }

    fn name(&self) -> &str {
        "read-only"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ensure_creates_single_version() {
    let store = Arc::new(CountingStore::new());
    let vault = Arc::new(SecretVault::new(store.clone()));
    let policy = SecretPolicy::default();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let vault = vault.clone();
        let policy = policy.clone();
        handles.push(tokio::spawn(async move {
            vault.ensure("otp", &policy, RotationPolicy::Never).await.unwrap()
        }));
    }

    let mut generated = 0;
    let mut versions = Vec::new();
    for handle in handles {
        let (secret, outcome) = handle.await.unwrap();
        if outcome == EnsureOutcome::Generated {
            generated += 1;
        }
        versions.push(secret.current_version);
    }

    assert_eq!(generated, 1);
    assert_eq!(store.writes(), 1);
    assert!(versions.iter().all(|v| v == "v1"));
}

#[tokio::test]
async fn test_different_secret_ids_are_independent() {
    let vault = SecretVault::new(Arc::new(MemoryStore::new()));
    let policy = SecretPolicy::default();

    let (a, _) = vault.ensure("otp-a", &policy, RotationPolicy::Never).await.unwrap();
    let (b, _) = vault.ensure("otp-b", &policy, RotationPolicy::Never).await.unwrap();

    assert_eq!(a.current_version, "v1");
    assert_eq!(b.current_version, "v1");
    assert_ne!(a.value, b.value);
}

#[tokio::test]
async fn test_encrypted_store_behind_vault() {
    let dir = tempfile::tempdir().unwrap();
    let key = generate_key();
    let policy = SecretPolicy::default();

    let first = {
        let store = EncryptedFileStore::open(&key, dir.path()).await.unwrap();
        let vault = SecretVault::new(Arc::new(store));
        vault.ensure("otp", &policy, RotationPolicy::Never).await.unwrap().0
    };

    let store = EncryptedFileStore::open(&key, dir.path()).await.unwrap();
    let vault = SecretVault::new(Arc::new(store));
    let (again, outcome) = vault.ensure("otp", &policy, RotationPolicy::Never).await.unwrap();

    assert_eq!(outcome, EnsureOutcome::Reused);
    assert_eq!(again.value, first.value);
    assert_eq!(vault.store_name(), "encrypted");
}

#[tokio::test]
async fn test_store_failure_propagates() {
    let vault = SecretVault::new(Arc::new(ReadOnlyStore));
    let result = vault.ensure("otp", &SecretPolicy::default(), RotationPolicy::Never).await;
    assert!(matches!(result, Err(SecretsError::ProviderError(_))));
}

#[tokio::test]
async fn test_get_unknown_version_is_not_found() {
    let vault = SecretVault::new(Arc::new(MemoryStore::new()));
    vault.generate("otp", &SecretPolicy::default()).await.unwrap();

    let err = vault.get("otp", Some("v7")).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, SecretsError::NotFound { ref secret_id, .. } if secret_id == "otp"));
}
