//! Event Correlator
//!
//! Turns an at-least-once stream of "principal created" deliveries into
//! exactly one audit record per principal:
//! - Dedupe ledger keyed by principal name (`PENDING -> CORRELATED -> EMITTED`)
//! - Per-principal async lock around every ledger transition
//! - Bounded retry with exponential backoff while registry or vault writes
//!   are not yet visible, under an overall timeout
//! - Failures that end a delivery are published on an error channel
//! - Pluggable audit sink (log, HTTP webhook)

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use pa_common::CorrelationState;
use pa_registry::RegistryError;
use pa_secrets::SecretsError;

mod correlator;
mod ledger;
mod sink;

pub use correlator::{EventCorrelator, HandleOutcome};
pub use ledger::LedgerEntry;
pub use sink::{create_sink, AuditSink, HttpAuditSink, LogAuditSink, SinkError};

#[derive(Error, Debug)]
pub enum CorrelatorError {
    #[error("Correlation timed out for {principal_name} after {attempts} attempts: {last_error}")]
    CorrelationTimeout {
        principal_name: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Audit sink rejected record for {principal_name}: {source}")]
    SinkRejected {
        principal_name: String,
        #[source]
        source: SinkError,
    },

    #[error("Correlation cancelled for {principal_name}")]
    Cancelled { principal_name: String },

    #[error("Nothing to replay for {principal_name} (state {state})")]
    NothingToReplay {
        principal_name: String,
        state: CorrelationState,
    },

    #[error("Secret vault error: {0}")]
    Secrets(#[from] SecretsError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl CorrelatorError {
    /// Whether the event channel should redeliver
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CorrelatorError::CorrelationTimeout { .. } | CorrelatorError::Cancelled { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CorrelatorError>;

#[derive(Debug, Clone)]
pub struct CorrelatorSettings {
    /// Secret the audit record's value is read from
    pub secret_id: String,
    /// Retries after the first join attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Overall bound on joining one delivery
    pub timeout: Duration,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            secret_id: "one-time-password".to_string(),
            max_retries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        }
    }
}

impl CorrelatorSettings {
    /// Delay before retry number `retry` (1-based), doubling up to `max_backoff`
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    CorrelationTimeout,
    SinkRejected,
    Cancelled,
    Fatal,
}

/// A delivery that ended without emitting, as published on the error channel
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationFailure {
    pub principal_name: String,
    pub event_id: String,
    pub kind: FailureKind,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl CorrelationFailure {
    pub fn new(principal_name: &str, event_id: &str, kind: FailureKind, error: impl ToString) -> Self {
        Self {
            principal_name: principal_name.to_string(),
            event_id: event_id.to_string(),
            kind,
            error: error.to_string(),
            failed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let settings = CorrelatorSettings {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            ..Default::default()
        };
        assert_eq!(settings.backoff(1), Duration::from_millis(100));
        assert_eq!(settings.backoff(2), Duration::from_millis(200));
        assert_eq!(settings.backoff(3), Duration::from_millis(350));
        assert_eq!(settings.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_retryable_errors() {
        let timeout = CorrelatorError::CorrelationTimeout {
            principal_name: "ec2User".to_string(),
            attempts: 3,
            last_error: "Principal not found: ec2User".to_string(),
        };
        assert!(timeout.is_retryable());

        let rejected = CorrelatorError::SinkRejected {
            principal_name: "ec2User".to_string(),
            source: SinkError::Rejected("400".to_string()),
        };
        assert!(!rejected.is_retryable());
        assert!(rejected.to_string().contains("ec2User"));
    }
}
