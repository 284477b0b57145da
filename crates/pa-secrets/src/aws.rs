//! AWS Secrets Manager store
//!
//! Each secret id maps to one Secrets Manager secret named `{prefix}{secret_id}`.
//! New versions are written with PutSecretValue (CreateSecret on first write);
//! the version token is the Secrets Manager VersionId.
//!
//! Configuration via standard AWS SDK chain (env vars, instance profile, etc.)

use async_trait::async_trait;
use aws_sdk_secretsmanager::Client;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::{SecretStore, SecretsError, StoredVersion};

pub struct AwsSecretsManagerStore {
    client: Client,
    prefix: String,
}

impl AwsSecretsManagerStore {
    /// * `region` - Optional AWS region (uses default if not specified)
    /// * `prefix` - Prefix for secret names (e.g., "/provisioning/")
    pub async fn new(region: Option<String>, prefix: String) -> Result<Self, SecretsError> {
        let config = if let Some(region) = region {
            aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(aws_config::Region::new(region))
                .load()
                .await
        } else {
            aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await
        };

        let client = Client::new(&config);
        info!(prefix = %prefix, "Initialized AWS Secrets Manager store");

        Ok(Self { client, prefix })
    }

    fn full_name(&self, secret_id: &str) -> String {
        format!("{}{}", self.prefix, secret_id)
    }

    async fn create(&self, name: &str, value: &str) -> Result<String, SecretsError> {
        let response = self.client
            .create_secret()
            .name(name)
            .secret_string(value)
            .send()
            .await
            .map_err(|e| SecretsError::ProviderError(format!(
                "Failed to create secret in AWS Secrets Manager: {}", e
            )))?;

        response.version_id()
            .map(str::to_string)
            .ok_or_else(|| SecretsError::ProviderError("CreateSecret returned no version id".to_string()))
    }
}

#[async_trait]
impl SecretStore for AwsSecretsManagerStore {
    async fn put_version(&self, secret_id: &str, value: &str) -> Result<StoredVersion, SecretsError> {
        let name = self.full_name(secret_id);
        debug!(secret_name = %name, "Writing secret version to AWS Secrets Manager");

        let version = match self.client
            .put_secret_value()
            .secret_id(&name)
            .secret_string(value)
            .send()
            .await
        {
            Ok(response) => response.version_id()
                .map(str::to_string)
                .ok_or_else(|| SecretsError::ProviderError("PutSecretValue returned no version id".to_string()))?,
            Err(e) if e.as_service_error().map(|se| se.is_resource_not_found_exception()).unwrap_or(false) => {
                self.create(&name, value).await?
            }
            Err(e) => {
                return Err(SecretsError::ProviderError(format!(
                    "Failed to write secret to AWS Secrets Manager: {}", e
                )));
            }
        };

        Ok(StoredVersion {
            version,
            value: value.to_string(),
            created_at: Utc::now(),
        })
    }

    async fn get_version(&self, secret_id: &str, version: Option<&str>) -> Result<StoredVersion, SecretsError> {
        let name = self.full_name(secret_id);
        debug!(secret_name = %name, version = ?version, "Retrieving secret from AWS Secrets Manager");

        let response = self.client
            .get_secret_value()
            .secret_id(&name)
            .set_version_id(version.map(str::to_string))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|se| se.is_resource_not_found_exception()).unwrap_or(false) {
                    SecretsError::not_found(secret_id, version)
                } else {
                    SecretsError::ProviderError(format!(
                        "Failed to retrieve secret from AWS Secrets Manager: {}", e
                    ))
                }
            })?;

        let value = response.secret_string()
            .map(str::to_string)
            .ok_or_else(|| SecretsError::ProviderError(
                "Secret is stored as binary, but string expected".to_string()
            ))?;

        let created_at = response.created_date()
            .and_then(|d| DateTime::<Utc>::from_timestamp(d.secs(), d.subsec_nanos()))
            .unwrap_or_else(Utc::now);

        Ok(StoredVersion {
            version: response.version_id().unwrap_or_default().to_string(),
            value,
            created_at,
        })
    }

    fn name(&self) -> &str {
        "aws-sm"
    }
}
