//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "pa-server.toml",
    "./config/config.toml",
    "/etc/provisioning-audit/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found), apply environment overrides, then validate
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("PA_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS.iter().map(PathBuf::from).find(|p| p.exists())
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) -> Result<(), ConfigError> {
        // HTTP
        if let Some(port) = parsed("PA_HTTP_PORT")? {
            config.http.port = port;
        }
        if let Ok(val) = env::var("PA_HTTP_HOST") {
            config.http.host = val;
        }

        // Secrets
        if let Ok(val) = env::var("PA_SECRETS_PROVIDER") {
            config.secrets.provider = val;
        }
        if let Ok(val) = env::var("PA_SECRET_ID") {
            config.secrets.secret_id = val;
        }
        if let Ok(val) = env::var("PA_SECRETS_ENCRYPTION_KEY") {
            config.secrets.encryption_key = val;
        }
        if let Ok(val) = env::var("PA_SECRETS_DATA_DIR") {
            config.secrets.data_dir = val;
        }
        if let Ok(val) = env::var("PA_SECRETS_AWS_REGION") {
            config.secrets.aws_region = val;
        }
        if let Ok(val) = env::var("PA_SECRETS_AWS_PREFIX") {
            config.secrets.aws_prefix = val;
        }
        if let Some(secs) = parsed("PA_SECRETS_ROTATE_AFTER_SECS")? {
            config.secrets.rotate_after_secs = secs;
        }
        if let Some(len) = parsed("PA_SECRETS_MIN_LENGTH")? {
            config.secrets.policy.min_length = len;
        }

        // Provisioner
        if let Ok(val) = env::var("PA_MANIFEST_PATH") {
            config.provisioner.manifest_path = val;
        }
        if let Ok(val) = env::var("PA_REGISTRY_SNAPSHOT_PATH") {
            config.provisioner.registry_snapshot_path = val;
        }
        if let Some(flag) = parsed("PA_PROVISION_ON_STARTUP")? {
            config.provisioner.provision_on_startup = flag;
        }

        // Correlator
        if let Some(retries) = parsed("PA_CORRELATOR_MAX_RETRIES")? {
            config.correlator.max_retries = retries;
        }
        if let Some(ms) = parsed("PA_CORRELATOR_TIMEOUT_MS")? {
            config.correlator.timeout_ms = ms;
        }

        // Audit
        if let Ok(val) = env::var("PA_AUDIT_SINK") {
            config.audit.sink = val;
        }
        if let Ok(val) = env::var("PA_AUDIT_WEBHOOK_URL") {
            config.audit.webhook_url = val;
        }

        if let Some(flag) = parsed("PA_DEV_MODE")? {
            config.dev_mode = flag;
        }

        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Read and parse an env var; a present but malformed value is a configuration error
fn parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::ValidationError(format!("{} has an invalid value: {}", name, val))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_explicit_path_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[secrets]\nsecret_id = \"ec2-user-password\"").unwrap();

        let config = ConfigLoader::with_path(file.path()).load().unwrap();
        assert_eq!(config.secrets.secret_id, "ec2-user-password");
    }

    #[test]
    fn test_invalid_file_fails_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[audit]\nsink = \"carrier-pigeon\"").unwrap();

        let result = ConfigLoader::with_path(file.path()).load();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}
