//! Transition Gate: decides whether a candidate state is persisted.
//!
//! ```text
//! candidate ─► snapshot(portal_run_id) ─► policy.decide(history)
//!                  ▲                           │
//!                  │ Conflict                  ├─► Ignore(reason)
//!                  │ (bounded retries)         │
//!                  └──── append(expected_version) ◄─ Accept
//! ```
//!
//! The decision and the append are atomic per run through the store's
//! conditional append: if another writer appended between our read and our
//! write, the append fails and the whole decision is made again on fresh
//! state. Two racing candidates for the same instant can therefore never both
//! be accepted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::{LedgerSnapshot, NewStateRecord, Run, StateChange, StateRecord};
use crate::error::StorageError;
use crate::policy::{Decision, IgnoreReason, TransitionPolicy};
use crate::store::StateStore;

/// Bounded exponential backoff for retryable storage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (`attempt` starts at 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub enum GateOutcome {
    /// The candidate was appended. `run` includes the new record.
    Accepted { record: StateRecord, run: Run },
    /// Nothing was written.
    Ignored { reason: IgnoreReason, run: Run },
}

/// A failed attempt, tagged with the store call that failed.
enum AttemptError {
    Read(StorageError),
    /// The append may have been applied when this is a timeout.
    Append(StorageError),
}

impl AttemptError {
    fn phase(&self) -> &'static str {
        match self {
            AttemptError::Read(_) => "snapshot",
            AttemptError::Append(_) => "append",
        }
    }

    fn into_inner(self) -> StorageError {
        match self {
            AttemptError::Read(err) | AttemptError::Append(err) => err,
        }
    }
}

pub struct TransitionGate {
    store: Arc<dyn StateStore>,
    policy: TransitionPolicy,
    identity_window: chrono::Duration,
    retry: RetryPolicy,
    store_timeout: Duration,
}

impl TransitionGate {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            policy: TransitionPolicy::default(),
            identity_window: chrono::Duration::minutes(5),
            retry: RetryPolicy::default(),
            store_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_policy(mut self, policy: TransitionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Tolerance for matching records whose identity fields drifted.
    pub fn with_identity_window(mut self, window: chrono::Duration) -> Self {
        self.identity_window = window;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn policy(&self) -> TransitionPolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Submit a candidate, retrying retryable storage failures.
    pub async fn submit(&self, change: StateChange) -> Result<GateOutcome, StorageError> {
        let candidate = NewStateRecord::from(change.clone());
        let mut attempt = 0;
        let mut append_in_doubt = false;

        loop {
            attempt += 1;
            match self.try_submit(&change, &candidate).await {
                Ok(GateOutcome::Ignored {
                    reason: IgnoreReason::Duplicate { record_id },
                    run,
                }) if append_in_doubt && record_id == candidate.id => {
                    // Our own earlier append landed before its timeout fired.
                    if let Some(record) = run.history().iter().find(|r| r.id == record_id).cloned() {
                        info!(
                            portal_run_id = %change.portal_run_id(),
                            record_id = %record.id,
                            "timed-out append was applied"
                        );
                        return Ok(GateOutcome::Accepted { record, run });
                    }
                    return Ok(GateOutcome::Ignored {
                        reason: IgnoreReason::Duplicate { record_id },
                        run,
                    });
                }
                Ok(outcome) => {
                    self.log_outcome(&change, &outcome);
                    return Ok(outcome);
                }
                Err(failure) => {
                    let phase = failure.phase();
                    let timed_out_append =
                        matches!(failure, AttemptError::Append(StorageError::Timeout(_)));
                    let err = failure.into_inner();
                    if !(err.is_retryable() && attempt < self.retry.max_attempts) {
                        warn!(
                            portal_run_id = %change.portal_run_id(),
                            attempt,
                            phase,
                            error = %err,
                            "state transition failed"
                        );
                        return Err(err);
                    }
                    append_in_doubt |= timed_out_append;
                    let delay = self.retry.backoff(attempt);
                    debug!(
                        portal_run_id = %change.portal_run_id(),
                        attempt,
                        phase,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying state transition"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_submit(
        &self,
        change: &StateChange,
        candidate: &NewStateRecord,
    ) -> Result<GateOutcome, AttemptError> {
        let snapshot = self
            .timed(self.store.snapshot(change.portal_run_id()))
            .await
            .map_err(AttemptError::Read)?;
        let history = self.history_for(&snapshot, change);

        match self
            .policy
            .decide(&history, &change.status, change.timestamp)
        {
            Decision::Ignore(reason) => Ok(GateOutcome::Ignored {
                reason,
                run: Run::new(change.identity.clone(), history),
            }),
            Decision::Accept => {
                let record = self
                    .timed(self.store.append(candidate.clone(), snapshot.version))
                    .await
                    .map_err(AttemptError::Append)?;
                let mut records = history;
                records.push(record.clone());
                Ok(GateOutcome::Accepted {
                    record,
                    run: Run::new(change.identity.clone(), records),
                })
            }
        }
    }

    /// Records the candidate is compared against.
    ///
    /// Falls back to same-portal-run records near the candidate's timestamp
    /// when identity fields drifted across retries.
    fn history_for(&self, snapshot: &LedgerSnapshot, change: &StateChange) -> Vec<StateRecord> {
        let matching = snapshot.matching(&change.identity);
        if !matching.is_empty() || snapshot.records.is_empty() {
            return matching;
        }
        let nearby = snapshot.within_window(None, Some(change.timestamp), self.identity_window);
        if !nearby.is_empty() {
            warn!(
                portal_run_id = %change.portal_run_id(),
                identity = %change.identity,
                nearby = nearby.len(),
                "no record matches run identity, comparing against records in tolerance window"
            );
        }
        nearby
    }

    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        tokio::time::timeout(self.store_timeout, call)
            .await
            .map_err(|_| StorageError::Timeout(self.store_timeout))?
    }

    fn log_outcome(&self, change: &StateChange, outcome: &GateOutcome) {
        match outcome {
            GateOutcome::Accepted { record, .. } => info!(
                portal_run_id = %change.portal_run_id(),
                status = %record.status,
                seq = record.seq,
                "state accepted"
            ),
            GateOutcome::Ignored { reason, .. } if reason.is_conflict() => warn!(
                portal_run_id = %change.portal_run_id(),
                status = %change.status,
                reason = reason.label(),
                detail = %reason,
                "state ignored"
            ),
            GateOutcome::Ignored { reason, .. } => debug!(
                portal_run_id = %change.portal_run_id(),
                status = %change.status,
                reason = reason.label(),
                detail = %reason,
                "state ignored"
            ),
        }
    }
}
