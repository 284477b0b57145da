//! Provisioner
//!
//! Reconciles a desired state against the principal registry and the secret
//! vault. A pass:
//! 1. ensures the shared one-time secret has a valid version
//! 2. puts declared groups, then upserts each principal with its membership
//! 3. attaches contact metadata, retrying `UnknownPrincipal` misses once
//!    after every principal write of the pass has completed
//!
//! Every step is idempotent, so a pass that failed part-way is repaired by
//! simply running it again.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use pa_common::{Group, Principal};
use pa_registry::{PrincipalRegistry, RegistryError, UpsertOutcome};
use pa_secrets::{EnsureOutcome, RotationPolicy, SecretPolicy, SecretVault, SecretsError};

mod manifest;

pub use manifest::{DesiredPrincipal, DesiredState, GroupPolicy, Resource};

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Secret vault error: {0}")]
    Secrets(#[from] SecretsError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ProvisionerSettings {
    /// Identifier of the shared one-time password
    pub secret_id: String,
    pub policy: SecretPolicy,
    pub rotation: RotationPolicy,
    /// Registry snapshot written after every pass
    pub snapshot_path: Option<PathBuf>,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            secret_id: "one-time-password".to_string(),
            policy: SecretPolicy::default(),
            rotation: RotationPolicy::Never,
            snapshot_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Group,
    Principal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryChange {
    Created,
    Updated,
    Unchanged,
}

impl From<UpsertOutcome> for EntryChange {
    fn from(outcome: UpsertOutcome) -> Self {
        match outcome {
            UpsertOutcome::Created => EntryChange::Created,
            UpsertOutcome::Updated => EntryChange::Updated,
            UpsertOutcome::Unchanged => EntryChange::Unchanged,
        }
    }
}

impl EntryChange {
    fn merge(self, changed: bool) -> Self {
        match self {
            EntryChange::Unchanged if changed => EntryChange::Updated,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryOutcome {
    pub kind: EntryKind,
    pub name: String,
    pub change: EntryChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryFailure {
    pub kind: EntryKind,
    pub name: String,
    pub error: String,
}

/// Result of one provisioning pass
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionReport {
    pub secret_id: String,
    pub secret_version: String,
    pub secret_generated: bool,
    pub succeeded: Vec<EntryOutcome>,
    pub failed: Vec<EntryFailure>,
    /// Registry changes are applied even when the snapshot write fails
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_error: Option<String>,
}

impl ProvisionReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.snapshot_error.is_none()
    }

    pub fn changed(&self) -> usize {
        self.succeeded.iter().filter(|e| e.change != EntryChange::Unchanged).count()
    }

    pub fn outcome(&self, kind: EntryKind, name: &str) -> Option<&EntryOutcome> {
        self.succeeded.iter().find(|e| e.kind == kind && e.name == name)
    }

    pub fn failure(&self, kind: EntryKind, name: &str) -> Option<&EntryFailure> {
        self.failed.iter().find(|e| e.kind == kind && e.name == name)
    }

    fn fail(&mut self, kind: EntryKind, name: &str, err: impl std::fmt::Display) {
        warn!(kind = ?kind, name = %name, error = %err, "Provisioning entry failed");
        metrics::counter!("provisioner.entries.failed_total").increment(1);
        self.failed.push(EntryFailure {
            kind,
            name: name.to_string(),
            error: err.to_string(),
        });
    }
}

pub struct Provisioner {
    registry: Arc<PrincipalRegistry>,
    vault: Arc<SecretVault>,
    settings: ProvisionerSettings,
    pass_lock: Mutex<()>,
}

impl Provisioner {
    pub fn new(registry: Arc<PrincipalRegistry>, vault: Arc<SecretVault>, settings: ProvisionerSettings) -> Self {
        Self {
            registry,
            vault,
            settings,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &ProvisionerSettings {
        &self.settings
    }

    /// Run one reconciliation pass.
    ///
    /// Only a secret failure aborts the pass; entry failures are collected in
    /// the report and leave the rest of the pass running.
    pub async fn provision(&self, desired: &DesiredState) -> Result<ProvisionReport, ProvisionError> {
        let _pass = self.pass_lock.lock().await;

        let (secret, ensured) = self
            .vault
            .ensure(&self.settings.secret_id, &self.settings.policy, self.settings.rotation)
            .await?;

        let mut report = ProvisionReport {
            secret_id: secret.secret_id.clone(),
            secret_version: secret.current_version.clone(),
            secret_generated: ensured == EnsureOutcome::Generated,
            succeeded: Vec::new(),
            failed: Vec::new(),
            snapshot_error: None,
        };

        for policy in &desired.groups {
            match self.registry.put_group(policy.to_group()) {
                Ok(outcome) => report.succeeded.push(EntryOutcome {
                    kind: EntryKind::Group,
                    name: policy.name.clone(),
                    change: outcome.into(),
                }),
                Err(e) => report.fail(EntryKind::Group, &policy.name, e),
            }
        }

        let mut written = Vec::new();
        for desired_principal in &desired.principals {
            match self.apply_principal(desired, desired_principal, &secret.current_version) {
                Ok(change) => written.push((desired_principal, change)),
                Err(e) => report.fail(EntryKind::Principal, &desired_principal.name, e),
            }
        }

        let deferred = self.attach_metadata(&mut report, written);
        self.retry_metadata(&mut report, deferred);

        if let Some(path) = &self.settings.snapshot_path {
            if let Err(e) = self.registry.save_snapshot(path).await {
                error!(path = ?path, error = %e, "Failed to write registry snapshot");
                report.snapshot_error = Some(e.to_string());
            }
        }

        if report.is_success() {
            info!(
                secret_version = %report.secret_version,
                secret_generated = report.secret_generated,
                entries = report.succeeded.len(),
                changed = report.changed(),
                "Provisioning pass completed"
            );
        } else {
            error!(
                secret_version = %report.secret_version,
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                snapshot_written = report.snapshot_error.is_none(),
                "Provisioning pass completed with failures"
            );
        }

        Ok(report)
    }

    /// First metadata attempt. Returns the entries whose principal was not
    /// visible, to be retried once by `retry_metadata`.
    fn attach_metadata<'d>(
        &self,
        report: &mut ProvisionReport,
        written: Vec<(&'d DesiredPrincipal, EntryChange)>,
    ) -> Vec<(&'d DesiredPrincipal, EntryChange)> {
        let mut deferred = Vec::new();
        for (desired_principal, change) in written {
            match self.registry.set_metadata(&desired_principal.name, &desired_principal.contact_email) {
                Ok(changed) => report.succeeded.push(principal_outcome(desired_principal, change.merge(changed))),
                Err(RegistryError::UnknownPrincipal { .. }) => {
                    debug!(principal = %desired_principal.name, "Principal not visible yet, deferring metadata");
                    deferred.push((desired_principal, change));
                }
                Err(e) => report.fail(EntryKind::Principal, &desired_principal.name, e),
            }
        }
        deferred
    }

    fn retry_metadata(&self, report: &mut ProvisionReport, deferred: Vec<(&DesiredPrincipal, EntryChange)>) {
        for (desired_principal, change) in deferred {
            match self.registry.set_metadata(&desired_principal.name, &desired_principal.contact_email) {
                Ok(changed) => report.succeeded.push(principal_outcome(desired_principal, change.merge(changed))),
                Err(e) => report.fail(EntryKind::Principal, &desired_principal.name, e),
            }
        }
    }

    /// Upsert one principal and its membership. Existing principals keep
    /// their creation time, initial secret version, reset flag and metadata.
    fn apply_principal(
        &self,
        desired: &DesiredState,
        desired_principal: &DesiredPrincipal,
        secret_version: &str,
    ) -> Result<EntryChange, RegistryError> {
        if !desired.declares_group(&desired_principal.group) && self.registry.get_group(&desired_principal.group).is_err() {
            warn!(
                principal = %desired_principal.name,
                group = %desired_principal.group,
                "Group not declared, creating it without permissions"
            );
            self.registry.put_group(Group::new(desired_principal.group.clone()))?;
        }

        let principal = match self.registry.get(&desired_principal.name) {
            Ok(existing) => existing,
            Err(RegistryError::NotFound { .. }) => {
                Principal::new(desired_principal.name.clone()).with_initial_secret_version(secret_version)
            }
            Err(e) => return Err(e),
        };
        let principal = match principal.initial_secret_version {
            Some(_) => principal,
            None => principal.with_initial_secret_version(secret_version),
        };

        let change = EntryChange::from(self.registry.upsert(principal)?);
        let joined = self.registry.add_to_group(&desired_principal.name, &desired_principal.group)?;
        Ok(change.merge(joined))
    }
}

fn principal_outcome(desired_principal: &DesiredPrincipal, change: EntryChange) -> EntryOutcome {
    EntryOutcome {
        kind: EntryKind::Principal,
        name: desired_principal.name.clone(),
        change,
    }
}
