//! SecretVault - generation and versioned retrieval of the shared one-time secret
//!
//! Generation for a given secret id is a single-writer section: concurrent
//! callers of `ensure` for the same id serialize on a per-id async lock, so
//! at most one of them ever writes a new version.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{SecretPolicy, SecretStore, SecretsError, StoredVersion};

/// A generated one-time password version
#[derive(Clone, PartialEq, Eq)]
pub struct OneTimeSecret {
    pub secret_id: String,
    pub current_version: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

impl OneTimeSecret {
    fn from_stored(secret_id: &str, stored: StoredVersion) -> Self {
        Self {
            secret_id: secret_id.to_string(),
            current_version: stored.version,
            value: stored.value,
            created_at: stored.created_at,
        }
    }
}

impl fmt::Debug for OneTimeSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneTimeSecret")
            .field("secret_id", &self.secret_id)
            .field("current_version", &self.current_version)
            .field("value", &"***")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// When an existing version stops counting as valid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationPolicy {
    /// Never regenerate automatically
    #[default]
    Never,
    /// Regenerate once the current version is older than this
    After(Duration),
}

impl RotationPolicy {
    /// `0` means never
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            Self::Never
        } else {
            Self::After(Duration::from_secs(secs))
        }
    }

    pub fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            RotationPolicy::Never => false,
            RotationPolicy::After(ttl) => {
                let age = now.signed_duration_since(created_at);
                age.to_std().map(|age| age >= *ttl).unwrap_or(false)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Generated,
    Reused,
}

pub struct SecretVault {
    store: Arc<dyn SecretStore>,
    writers: DashMap<String, Arc<Mutex<()>>>,
}

impl SecretVault {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            writers: DashMap::new(),
        }
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    fn writer_lock(&self, secret_id: &str) -> Arc<Mutex<()>> {
        self.writers.entry(secret_id.to_string()).or_default().clone()
    }

    /// Generate and persist a new version meeting `policy`
    pub async fn generate(&self, secret_id: &str, policy: &SecretPolicy) -> Result<OneTimeSecret, SecretsError> {
        let lock = self.writer_lock(secret_id);
        let _guard = lock.lock().await;
        self.generate_locked(secret_id, policy).await
    }

    async fn generate_locked(&self, secret_id: &str, policy: &SecretPolicy) -> Result<OneTimeSecret, SecretsError> {
        policy.check_satisfiable().map_err(|reason| SecretsError::PolicyViolation {
            secret_id: secret_id.to_string(),
            reason,
        })?;

        let value = policy.generate().ok_or_else(|| SecretsError::PolicyViolation {
            secret_id: secret_id.to_string(),
            reason: format!("no compliant value after {} attempts", crate::MAX_GENERATION_ATTEMPTS),
        })?;

        let stored = self.store.put_version(secret_id, &value).await?;
        metrics::counter!("vault.versions.generated_total").increment(1);
        info!(secret_id = %secret_id, version = %stored.version, store = self.store.name(), "Generated secret version");

        Ok(OneTimeSecret::from_stored(secret_id, stored))
    }

    /// Value of `version`, or of the current version when None
    pub async fn get(&self, secret_id: &str, version: Option<&str>) -> Result<String, SecretsError> {
        Ok(self.store.get_version(secret_id, version).await?.value)
    }

    /// Current version, if one exists
    pub async fn current(&self, secret_id: &str) -> Result<Option<OneTimeSecret>, SecretsError> {
        match self.store.get_version(secret_id, None).await {
            Ok(stored) => Ok(Some(OneTimeSecret::from_stored(secret_id, stored))),
            Err(SecretsError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Return the current valid version, generating one only if none exists
    /// or `rotation` marks the current one expired
    pub async fn ensure(
        &self,
        secret_id: &str,
        policy: &SecretPolicy,
        rotation: RotationPolicy,
    ) -> Result<(OneTimeSecret, EnsureOutcome), SecretsError> {
        let lock = self.writer_lock(secret_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.current(secret_id).await? {
            if !rotation.is_expired(existing.created_at, Utc::now()) {
                debug!(secret_id = %secret_id, version = %existing.current_version, "Reusing current secret version");
                return Ok((existing, EnsureOutcome::Reused));
            }
            info!(secret_id = %secret_id, version = %existing.current_version, "Current secret version expired");
        }

        let generated = self.generate_locked(secret_id, policy).await?;
        Ok((generated, EnsureOutcome::Generated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn vault() -> SecretVault {
        SecretVault::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_rotation_policy() {
        let now = Utc::now();
        let old = now - chrono::Duration::hours(2);
        assert!(!RotationPolicy::Never.is_expired(old, now));
        assert!(RotationPolicy::from_secs(3600).is_expired(old, now));
        assert!(!RotationPolicy::from_secs(3 * 3600).is_expired(old, now));
        assert_eq!(RotationPolicy::from_secs(0), RotationPolicy::Never);
    }

    #[tokio::test]
    async fn test_ensure_generates_once() {
        let vault = vault();
        let policy = SecretPolicy::default();

        let (first, outcome) = vault.ensure("otp", &policy, RotationPolicy::Never).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Generated);
        assert_eq!(first.current_version, "v1");

        let (second, outcome) = vault.ensure("otp", &policy, RotationPolicy::Never).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Reused);
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_expired_version_is_replaced_and_old_one_kept() {
        let vault = vault();
        let policy = SecretPolicy::default();

        let (first, _) = vault.ensure("otp", &policy, RotationPolicy::Never).await.unwrap();
        let (second, outcome) = vault
            .ensure("otp", &policy, RotationPolicy::After(Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(outcome, EnsureOutcome::Generated);
        assert_eq!(second.current_version, "v2");
        assert_eq!(vault.get("otp", Some("v1")).await.unwrap(), first.value);
        assert_eq!(vault.get("otp", None).await.unwrap(), second.value);
    }

    #[tokio::test]
    async fn test_policy_violation_carries_secret_id() {
        let vault = vault();
        let policy = SecretPolicy::new(12, "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~", true);

        match vault.generate("otp", &policy).await {
            Err(SecretsError::PolicyViolation { secret_id, .. }) => assert_eq!(secret_id, "otp"),
            other => panic!("expected policy violation, got {:?}", other.map(|s| s.current_version)),
        }
        assert!(vault.current("otp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_debug_hides_value() {
        let vault = vault();
        let secret = vault.generate("otp", &SecretPolicy::default()).await.unwrap();
        assert!(!format!("{:?}", secret).contains(&secret.value));
    }
}
