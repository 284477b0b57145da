//! Dedupe ledger
//!
//! Entries are only written while the principal's lock is held. Readers that
//! just want the state go straight to `entries` and never wait on the lock.
//! A principal's lock is dropped again once a claim ends without leaving an
//! entry behind, so names that never correlate do not accumulate.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::warn;

use pa_common::{AuditRecord, CorrelationState};

use crate::{CorrelationFailure, FailureKind};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerEntry {
    pub state: CorrelationState,
    /// Present once correlated; re-emitted verbatim by a replay
    pub record: Option<AuditRecord>,
    /// Delivery that produced the record
    pub event_id: Option<String>,
}

#[derive(Default)]
pub(crate) struct Ledger {
    locks: DashMap<String, Arc<Mutex<()>>>,
    entries: DashMap<String, LedgerEntry>,
}

impl Ledger {
    pub(crate) fn get(&self, principal_name: &str) -> LedgerEntry {
        self.entries
            .get(principal_name)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub(crate) fn state(&self, principal_name: &str) -> CorrelationState {
        self.entries
            .get(principal_name)
            .map(|e| e.state)
            .unwrap_or_default()
    }

    pub(crate) async fn lock(&self, principal_name: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(principal_name.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    /// Caller must hold the principal's lock
    pub(crate) fn set(&self, principal_name: &str, entry: LedgerEntry) {
        self.entries.insert(principal_name.to_string(), entry);
    }

    /// Caller must hold the principal's lock
    pub(crate) fn clear(&self, principal_name: &str) {
        self.entries.remove(principal_name);
    }

    /// Forget the lock of a principal with no entry. Caller holds the lock, so
    /// the map and the caller's guard account for two references; any more
    /// means another delivery is queued on it.
    pub(crate) fn prune(&self, principal_name: &str) {
        if self.entries.contains_key(principal_name) {
            return;
        }
        self.locks.remove_if(principal_name, |_, lock| Arc::strong_count(lock) <= 2);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive claim on a pending principal for one delivery.
///
/// Dropped without `resolve()` (the delivery future was cancelled) a
/// `Cancelled` failure is published. Before the record is correlated the entry
/// goes back to `PENDING`. After that the sink may already hold the record, so
/// the entry stays `CORRELATED` and only a replay can emit it again.
pub(crate) struct Claim<'a> {
    ledger: &'a Ledger,
    failures: &'a mpsc::UnboundedSender<CorrelationFailure>,
    principal_name: String,
    event_id: String,
    correlated: bool,
    resolved: bool,
    _lock: OwnedMutexGuard<()>,
}

impl<'a> Claim<'a> {
    pub(crate) fn new(
        ledger: &'a Ledger,
        failures: &'a mpsc::UnboundedSender<CorrelationFailure>,
        principal_name: &str,
        event_id: &str,
        lock: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            ledger,
            failures,
            principal_name: principal_name.to_string(),
            event_id: event_id.to_string(),
            correlated: false,
            resolved: false,
            _lock: lock,
        }
    }

    pub(crate) fn set(&mut self, entry: LedgerEntry) {
        self.correlated |= entry.state != CorrelationState::Pending;
        self.ledger.set(&self.principal_name, entry);
    }

    pub(crate) fn resolve(mut self) {
        self.resolved = true;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        // Runs before `_lock` is released
        if !self.resolved {
            self.cancel();
        }
        if !self.correlated {
            self.ledger.prune(&self.principal_name);
        }
    }
}

impl Claim<'_> {
    fn cancel(&self) {
        if self.correlated {
            warn!(
                principal = %self.principal_name,
                event_id = %self.event_id,
                "Correlation cancelled during emit, entry kept CORRELATED for replay"
            );
        } else {
            self.ledger.clear(&self.principal_name);
            warn!(
                principal = %self.principal_name,
                event_id = %self.event_id,
                "Correlation cancelled, entry returned to PENDING"
            );
        }
        metrics::counter!("correlator.failures_total").increment(1);
        let _ = self.failures.send(CorrelationFailure::new(
            &self.principal_name,
            &self.event_id,
            FailureKind::Cancelled,
            format!("Correlation cancelled for {}", self.principal_name),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlated_entry() -> LedgerEntry {
        LedgerEntry {
            state: CorrelationState::Correlated,
            record: Some(AuditRecord::new("ec2User", "a@x.com", "secret")),
            event_id: Some("evt-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_unresolved_claim_before_correlation_resets_entry() {
        let ledger = Ledger::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let lock = ledger.lock("ghost").await;
        drop(Claim::new(&ledger, &tx, "ghost", "evt-1", lock));

        assert_eq!(ledger.state("ghost"), CorrelationState::Pending);
        assert_eq!(rx.try_recv().unwrap().kind, FailureKind::Cancelled);
        assert_eq!(ledger.tracked(), 0);
    }

    #[tokio::test]
    async fn test_unresolved_claim_after_correlation_keeps_record() {
        let ledger = Ledger::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let lock = ledger.lock("ec2User").await;
        let mut claim = Claim::new(&ledger, &tx, "ec2User", "evt-1", lock);
        claim.set(correlated_entry());
        drop(claim);

        assert_eq!(ledger.get("ec2User"), correlated_entry());
        assert_eq!(rx.try_recv().unwrap().kind, FailureKind::Cancelled);
        assert_eq!(ledger.tracked(), 1);
    }

    #[tokio::test]
    async fn test_resolved_claim_without_entry_forgets_lock() {
        let ledger = Ledger::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..10 {
            let name = format!("ghost-{}", i);
            let lock = ledger.lock(&name).await;
            Claim::new(&ledger, &tx, &name, "evt", lock).resolve();
        }

        assert_eq!(ledger.tracked(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_queued_delivery_keeps_lock() {
        let ledger = Arc::new(Ledger::default());
        let (tx, _rx) = mpsc::unbounded_channel();

        let lock = ledger.lock("ghost").await;
        let waiter = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                let _lock = ledger.lock("ghost").await;
            })
        };
        while ledger.locks.get("ghost").map(|l| Arc::strong_count(l.value())).unwrap_or(0) < 3 {
            tokio::task::yield_now().await;
        }

        Claim::new(&ledger, &tx, "ghost", "evt-1", lock).resolve();
        assert_eq!(ledger.tracked(), 1);

        waiter.await.unwrap();
    }
}
