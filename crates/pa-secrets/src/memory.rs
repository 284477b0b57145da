//! In-memory versioned secret store

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::{SecretStore, SecretsError, StoredVersion};

/// Version history of one secret; the last entry is current
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct SecretHistory {
    pub(crate) versions: Vec<StoredVersion>,
}

impl SecretHistory {
    pub(crate) fn append(&mut self, value: &str) -> StoredVersion {
        let stored = StoredVersion {
            version: format!("v{}", self.versions.len() + 1),
            value: value.to_string(),
            created_at: Utc::now(),
        };
        self.versions.push(stored.clone());
        stored
    }

    pub(crate) fn lookup(&self, version: Option<&str>) -> Option<&StoredVersion> {
        match version {
            Some(v) => self.versions.iter().find(|s| s.version == v),
            None => self.versions.last(),
        }
    }
}

/// Process-local store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    secrets: RwLock<HashMap<String, SecretHistory>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn put_version(&self, secret_id: &str, value: &str) -> Result<StoredVersion, SecretsError> {
        let mut secrets = self.secrets.write().await;
        Ok(secrets.entry(secret_id.to_string()).or_default().append(value))
    }

    async fn get_version(&self, secret_id: &str, version: Option<&str>) -> Result<StoredVersion, SecretsError> {
        let secrets = self.secrets.read().await;
        secrets
            .get(secret_id)
            .and_then(|history| history.lookup(version))
            .cloned()
            .ok_or_else(|| SecretsError::not_found(secret_id, version))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
