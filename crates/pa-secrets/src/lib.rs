//! One-Time Secret Vault
//!
//! Generates, stores and retrieves versions of a shared one-time password.
//! Storage is pluggable:
//! - In-memory (default, development and tests)
//! - Encrypted local file storage (AES-256-GCM)
//! - AWS Secrets Manager (with feature flag `aws`)
//!
//! Every backend is append-only: writing a value creates a new version which
//! becomes current; earlier versions stay readable by their version token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

mod encrypted;
mod memory;
mod policy;
mod vault;

pub use encrypted::{generate_key, EncryptedFileStore};
pub use memory::MemoryStore;
pub use policy::{SecretPolicy, MAX_GENERATION_ATTEMPTS};
pub use vault::{EnsureOutcome, OneTimeSecret, RotationPolicy, SecretVault};

#[cfg(feature = "aws")]
mod aws;
#[cfg(feature = "aws")]
pub use aws::AwsSecretsManagerStore;

#[derive(Error, Debug)]
pub enum SecretsError {
    #[error("Secret not found: {secret_id} (version {})", .version.as_deref().unwrap_or("current"))]
    NotFound { secret_id: String, version: Option<String> },
    #[error("Secret policy violation for {secret_id}: {reason}")]
    PolicyViolation { secret_id: String, reason: String },
    #[error("Invalid key format: {0}")]
    InvalidKey(String),
    #[error("Encryption error: {0}")]
    EncryptionError(String),
    #[error("Provider error: {0}")]
    ProviderError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl SecretsError {
    pub fn not_found(secret_id: impl Into<String>, version: Option<&str>) -> Self {
        Self::NotFound {
            secret_id: secret_id.into(),
            version: version.map(str::to_string),
        }
    }

    /// Lookup misses may resolve once a concurrent write becomes visible
    pub fn is_retryable(&self) -> bool {
        matches!(self, SecretsError::NotFound { .. })
    }
}

/// One stored version of a secret
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredVersion {
    pub version: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for StoredVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredVersion")
            .field("version", &self.version)
            .field("value", &"***")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Versioned key-value secret storage
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Append a new version, which becomes current
    async fn put_version(&self, secret_id: &str, value: &str) -> Result<StoredVersion, SecretsError>;

    /// Read a specific version, or the current one when `version` is None
    async fn get_version(&self, secret_id: &str, version: Option<&str>) -> Result<StoredVersion, SecretsError>;

    /// Provider name
    fn name(&self) -> &str;
}

/// Configuration for secret storage
#[derive(Debug, Clone)]
pub struct SecretsConfig {
    /// memory, encrypted, or aws-sm
    pub provider: String,
    /// Encryption key for local encrypted storage (base64-encoded 32-byte key)
    pub encryption_key: Option<String>,
    pub data_dir: PathBuf,
    pub aws_region: Option<String>,
    /// Prefix for AWS secret names (e.g., "/provisioning/")
    pub aws_prefix: Option<String>,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            provider: "memory".to_string(),
            encryption_key: None,
            data_dir: PathBuf::from("./data/secrets"),
            aws_region: None,
            aws_prefix: Some("/provisioning/".to_string()),
        }
    }
}

/// Create a store based on configuration
pub async fn create_store(config: &SecretsConfig) -> Result<Arc<dyn SecretStore>, SecretsError> {
    match config.provider.as_str() {
        "memory" => {
            info!("Using in-memory secret store");
            Ok(Arc::new(MemoryStore::new()))
        }
        "encrypted" => {
            let key = config.encryption_key.as_ref()
                .ok_or_else(|| SecretsError::ProviderError("Encryption key required for encrypted provider".to_string()))?;
            info!(data_dir = ?config.data_dir, "Using encrypted file secret store");
            let store = EncryptedFileStore::open(key, &config.data_dir).await?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "aws")]
        "aws-sm" => {
            info!("Using AWS Secrets Manager secret store");
            let store = AwsSecretsManagerStore::new(
                config.aws_region.clone(),
                config.aws_prefix.clone().unwrap_or_else(|| "/provisioning/".to_string()),
            ).await?;
            Ok(Arc::new(store))
        }
        other => Err(SecretsError::ProviderError(format!("Unknown provider: {}", other))),
    }
}
