//! Provisioning Audit Configuration
//!
//! TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub secrets: SecretsConfig,
    pub provisioner: ProvisionerConfig,
    pub correlator: CorrelatorConfig,
    pub audit: AuditConfig,

    /// Enable development mode
    pub dev_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Where the shared one-time secret lives and how it is generated
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// memory, encrypted, or aws-sm
    pub provider: String,
    /// Identifier of the shared one-time password secret
    pub secret_id: String,
    /// Base64 32-byte key for the encrypted provider
    pub encryption_key: String,
    pub data_dir: String,
    pub aws_region: String,
    pub aws_prefix: String,
    /// Regenerate the secret once the current version is older than this. 0 = never.
    pub rotate_after_secs: u64,
    pub policy: SecretPolicyConfig,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            provider: "memory".to_string(),
            secret_id: "one-time-password".to_string(),
            encryption_key: String::new(),
            data_dir: "./data/secrets".to_string(),
            aws_region: String::new(),
            aws_prefix: "/provisioning/".to_string(),
            rotate_after_secs: 0,
            policy: SecretPolicyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretPolicyConfig {
    pub min_length: usize,
    /// Characters never used in generated values
    pub excluded_chars: String,
    pub require_each_class: bool,
}

impl Default for SecretPolicyConfig {
    fn default() -> Self {
        Self {
            min_length: 16,
            excluded_chars: "\"'@/\\`".to_string(),
            require_each_class: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Desired-state manifest applied at startup and on POST /api/provision
    pub manifest_path: String,
    /// Durable registry snapshot. Empty keeps the registry in memory only.
    pub registry_snapshot_path: String,
    pub provision_on_startup: bool,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            manifest_path: "./provisioning.toml".to_string(),
            registry_snapshot_path: String::new(),
            provision_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound for joining a single delivery, retries included
    pub timeout_ms: u64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// log or http
    pub sink: String,
    pub webhook_url: String,
    pub timeout_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sink: "log".to_string(),
            webhook_url: String::new(),
            timeout_ms: 10_000,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Reject settings the services cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secrets.secret_id.trim().is_empty() {
            return Err(ConfigError::ValidationError("secrets.secret_id must not be empty".to_string()));
        }
        match self.secrets.provider.as_str() {
            "memory" | "aws-sm" => {}
            "encrypted" if self.secrets.encryption_key.is_empty() => {
                return Err(ConfigError::ValidationError(
                    "secrets.encryption_key is required for the encrypted provider".to_string(),
                ));
            }
            "encrypted" => {}
            other => {
                return Err(ConfigError::ValidationError(format!("Unknown secrets provider: {}", other)));
            }
        }
        if self.secrets.policy.min_length == 0 {
            return Err(ConfigError::ValidationError("secrets.policy.min_length must be positive".to_string()));
        }
        if self.correlator.initial_backoff_ms > self.correlator.max_backoff_ms {
            return Err(ConfigError::ValidationError(
                "correlator.initial_backoff_ms exceeds correlator.max_backoff_ms".to_string(),
            ));
        }
        if self.correlator.timeout_ms == 0 {
            return Err(ConfigError::ValidationError("correlator.timeout_ms must be positive".to_string()));
        }
        match self.audit.sink.as_str() {
            "log" => {}
            "http" if self.audit.webhook_url.is_empty() => {
                return Err(ConfigError::ValidationError(
                    "audit.webhook_url is required for the http sink".to_string(),
                ));
            }
            "http" => {}
            other => {
                return Err(ConfigError::ValidationError(format!("Unknown audit sink: {}", other)));
            }
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Provisioning Audit Configuration
# Environment variables (PA_*) override these settings

dev_mode = false

[http]
port = 8080
host = "0.0.0.0"

[secrets]
provider = "memory"  # memory, encrypted, or aws-sm
secret_id = "one-time-password"
encryption_key = ""
data_dir = "./data/secrets"
aws_region = ""
aws_prefix = "/provisioning/"
rotate_after_secs = 0  # 0 = never regenerate

[secrets.policy]
min_length = 16
excluded_chars = "\"'@/\\`"
require_each_class = true

[provisioner]
manifest_path = "./provisioning.toml"
registry_snapshot_path = ""
provision_on_startup = true

[correlator]
max_retries = 5
initial_backoff_ms = 200
max_backoff_ms = 5000
timeout_ms = 30000

[audit]
sink = "log"  # log or http
webhook_url = ""
timeout_ms = 10000
"#
        .to_string()
    }
}
