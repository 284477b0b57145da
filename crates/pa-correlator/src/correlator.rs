//! EventCorrelator - dedupe, join and emit

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use pa_common::{AuditRecord, CorrelationState, CreationEvent};
use pa_registry::PrincipalRegistry;
use pa_secrets::SecretVault;

use crate::ledger::{Claim, Ledger, LedgerEntry};
use crate::sink::AuditSink;
use crate::{CorrelationFailure, CorrelatorError, CorrelatorSettings, FailureKind, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// This delivery produced the principal's audit record
    Emitted(AuditRecord),
    /// The principal's record was already emitted
    Duplicate,
    /// A record exists but the sink refused it; only a replay emits it
    AwaitingReplay,
}

/// Outcome of one join attempt
enum Join {
    Ready(AuditRecord),
    /// Registry or vault write not visible yet
    Missing(String),
}

pub struct EventCorrelator {
    registry: Arc<PrincipalRegistry>,
    vault: Arc<SecretVault>,
    sink: Arc<dyn AuditSink>,
    settings: CorrelatorSettings,
    ledger: Ledger,
    failures: mpsc::UnboundedSender<CorrelationFailure>,
}

impl EventCorrelator {
    /// Returns the correlator and the receiving end of its error channel
    pub fn new(
        registry: Arc<PrincipalRegistry>,
        vault: Arc<SecretVault>,
        sink: Arc<dyn AuditSink>,
        settings: CorrelatorSettings,
    ) -> (Self, mpsc::UnboundedReceiver<CorrelationFailure>) {
        let (failures, failures_rx) = mpsc::unbounded_channel();
        info!(
            sink = sink.name(),
            max_retries = settings.max_retries,
            timeout_ms = settings.timeout.as_millis() as u64,
            "EventCorrelator initialized"
        );
        let correlator = Self {
            registry,
            vault,
            sink,
            settings,
            ledger: Ledger::default(),
            failures,
        };
        (correlator, failures_rx)
    }

    pub fn state(&self, principal_name: &str) -> CorrelationState {
        self.ledger.state(principal_name)
    }

    pub fn entry(&self, principal_name: &str) -> LedgerEntry {
        self.ledger.get(principal_name)
    }

    /// Process one delivery.
    ///
    /// Dropping the returned future is a cancellation and publishes a
    /// `Cancelled` failure. A claimed entry goes back to `PENDING`, unless the
    /// record already reached the sink, in which case it stays `CORRELATED`.
    pub async fn handle(&self, event: &CreationEvent) -> Result<HandleOutcome> {
        self.handle_claiming(event, &AtomicBool::new(false)).await
    }

    /// `claimed` is set once this delivery owns the principal's pending entry;
    /// from then on a cancellation is reported by the claim itself.
    async fn handle_claiming(&self, event: &CreationEvent, claimed: &AtomicBool) -> Result<HandleOutcome> {
        let name = event.principal_name.as_str();
        let lock = self.ledger.lock(name).await;

        let entry = self.ledger.get(name);
        match entry.state {
            CorrelationState::Emitted => {
                debug!(principal = %name, event_id = %event.event_id, "Duplicate delivery dropped");
                metrics::counter!("correlator.deliveries.duplicate_total").increment(1);
                return Ok(HandleOutcome::Duplicate);
            }
            CorrelationState::Correlated => {
                warn!(
                    principal = %name,
                    event_id = %event.event_id,
                    "Redelivery for a correlated record, waiting for replay"
                );
                metrics::counter!("correlator.deliveries.duplicate_total").increment(1);
                return Ok(HandleOutcome::AwaitingReplay);
            }
            CorrelationState::Pending => {}
        }

        let mut claim = Claim::new(&self.ledger, &self.failures, name, &event.event_id, lock);
        claimed.store(true, Ordering::SeqCst);

        let record = match self.join(event).await {
            Ok(record) => record,
            Err(e) => {
                let kind = match e {
                    CorrelatorError::CorrelationTimeout { .. } => FailureKind::CorrelationTimeout,
                    _ => FailureKind::Fatal,
                };
                self.report(event, kind, &e);
                claim.resolve();
                return Err(e);
            }
        };

        claim.set(LedgerEntry {
            state: CorrelationState::Correlated,
            record: Some(record.clone()),
            event_id: Some(event.event_id.clone()),
        });
        debug!(principal = %name, record_id = %record.record_id, "Event correlated");

        let result = self.emit(&record, &event.event_id).await;
        claim.resolve();
        result.map(HandleOutcome::Emitted)
    }

    /// `handle`, abandoned when `shutdown` fires first
    pub async fn handle_with_shutdown(
        &self,
        event: &CreationEvent,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<HandleOutcome> {
        let claimed = AtomicBool::new(false);
        tokio::select! {
            result = self.handle_claiming(event, &claimed) => result,
            _ = shutdown.recv() => {
                info!(principal = %event.principal_name, event_id = %event.event_id, "Shutdown signal received, abandoning correlation");
                let e = CorrelatorError::Cancelled { principal_name: event.principal_name.clone() };
                if !claimed.load(Ordering::SeqCst) {
                    self.report(event, FailureKind::Cancelled, &e);
                }
                Err(e)
            }
        }
    }

    /// Re-emit a correlated record the sink previously refused
    pub async fn replay(&self, principal_name: &str) -> Result<AuditRecord> {
        let _lock = self.ledger.lock(principal_name).await;

        let entry = self.ledger.get(principal_name);
        let record = match (entry.state, entry.record) {
            (CorrelationState::Correlated, Some(record)) => record,
            (state, _) => {
                self.ledger.prune(principal_name);
                return Err(CorrelatorError::NothingToReplay {
                    principal_name: principal_name.to_string(),
                    state,
                });
            }
        };

        let event_id = entry.event_id.unwrap_or_default();
        info!(principal = %principal_name, record_id = %record.record_id, "Replaying audit record");
        self.emit(&record, &event_id).await
    }

    /// Send a correlated record to the sink, stamped with the emission time.
    /// Caller holds the principal's lock.
    async fn emit(&self, record: &AuditRecord, event_id: &str) -> Result<AuditRecord> {
        let name = record.principal_name.as_str();
        let record = AuditRecord {
            emitted_at: Utc::now(),
            ..record.clone()
        };
        match self.sink.emit(&record).await {
            Ok(()) => {
                self.ledger.set(
                    name,
                    LedgerEntry {
                        state: CorrelationState::Emitted,
                        record: Some(record.clone()),
                        event_id: Some(event_id.to_string()),
                    },
                );
                metrics::counter!("correlator.records.emitted_total").increment(1);
                info!(principal = %name, record_id = %record.record_id, sink = self.sink.name(), "Audit record emitted");
                Ok(record)
            }
            Err(source) => {
                let e = CorrelatorError::SinkRejected {
                    principal_name: name.to_string(),
                    source,
                };
                metrics::counter!("correlator.failures_total").increment(1);
                error!(principal = %name, record_id = %record.record_id, error = %e, "Audit sink refused record");
                let _ = self.failures.send(CorrelationFailure::new(name, event_id, FailureKind::SinkRejected, &e));
                Err(e)
            }
        }
    }

    /// Join registry metadata and the secret value, retrying while either is
    /// missing. Bounded by `max_retries` and by `timeout`.
    async fn join(&self, event: &CreationEvent) -> Result<AuditRecord> {
        let name = event.principal_name.as_str();
        let mut attempts = 0u32;
        let mut last_error = String::new();

        let outcome = tokio::time::timeout(
            self.settings.timeout,
            self.join_with_retries(name, &mut attempts, &mut last_error),
        )
        .await;

        match outcome {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(Some(e))) => Err(e),
            Ok(Err(None)) | Err(_) => Err(CorrelatorError::CorrelationTimeout {
                principal_name: name.to_string(),
                attempts,
                last_error,
            }),
        }
    }

    /// `Err(None)` once retries are exhausted
    async fn join_with_retries(
        &self,
        name: &str,
        attempts: &mut u32,
        last_error: &mut String,
    ) -> std::result::Result<AuditRecord, Option<CorrelatorError>> {
        loop {
            *attempts += 1;
            match self.try_join(name).await? {
                Join::Ready(record) => return Ok(record),
                Join::Missing(reason) => *last_error = reason,
            }

            if *attempts > self.settings.max_retries {
                return Err(None);
            }

            let delay = self.settings.backoff(*attempts);
            debug!(
                principal = %name,
                attempt = *attempts,
                delay_ms = delay.as_millis() as u64,
                reason = %last_error,
                "Correlation data not visible yet, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn try_join(&self, name: &str) -> std::result::Result<Join, Option<CorrelatorError>> {
        let principal = match self.registry.get(name) {
            Ok(principal) => principal,
            Err(e) if e.is_retryable() => return Ok(Join::Missing(e.to_string())),
            Err(e) => return Err(Some(e.into())),
        };

        let Some(contact_email) = principal.contact_email.clone() else {
            return Ok(Join::Missing(format!("No contact metadata for {}", name)));
        };

        let version = principal.initial_secret_version.as_deref();
        let value = match self.vault.get(&self.settings.secret_id, version).await {
            Ok(value) => value,
            Err(e) if e.is_retryable() => return Ok(Join::Missing(e.to_string())),
            Err(e) => return Err(Some(e.into())),
        };

        Ok(Join::Ready(AuditRecord::new(name, contact_email, value)))
    }

    fn report(&self, event: &CreationEvent, kind: FailureKind, e: &CorrelatorError) {
        metrics::counter!("correlator.failures_total").increment(1);
        error!(
            principal = %event.principal_name,
            event_id = %event.event_id,
            kind = ?kind,
            error = %e,
            "Correlation failed"
        );
        let _ = self.failures.send(CorrelationFailure::new(&event.principal_name, &event.event_id, kind, e));
    }
}
