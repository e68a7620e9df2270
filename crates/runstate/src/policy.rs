//! Transition policies: the pure accept/ignore decision.
//!
//! Every policy enforces timestamp monotonicity per run. Beyond that, the
//! default [`TransitionPolicy::TimestampMonotonic`] trusts reporting engines
//! to know their own status graph: `SUCCEEDED` followed by a later `RUNNING`
//! is accepted. [`TransitionPolicy::Conventional`] layers the manager status
//! rules on top for services that want them enforced.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::core::{StateRecord, Status};

/// Minimum spacing between two accepted `RUNNING` updates under the
/// conventional policy.
pub const RUNNING_UPDATE_WINDOW_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransitionPolicy {
    /// Deduplication and ordering only.
    #[default]
    TimestampMonotonic,
    /// Ordering plus the manager status rules.
    Conventional { running_update_window: Duration },
}

impl TransitionPolicy {
    pub fn conventional() -> Self {
        TransitionPolicy::Conventional {
            running_update_window: Duration::seconds(RUNNING_UPDATE_WINDOW_SECS),
        }
    }

    /// Decide on a candidate given the run's history in timestamp order.
    pub fn decide(
        &self,
        history: &[StateRecord],
        status: &Status,
        timestamp: DateTime<Utc>,
    ) -> Decision {
        if let Some(seen) = history
            .iter()
            .find(|r| r.is_same_observation(status, timestamp))
        {
            return Decision::Ignore(IgnoreReason::Duplicate { record_id: seen.id });
        }

        let Some(latest) = history.last() else {
            if matches!(self, TransitionPolicy::Conventional { .. }) && *status != Status::Draft {
                warn!(status = %status, "first state of run is not DRAFT");
            }
            return Decision::Accept;
        };

        if timestamp < latest.timestamp {
            return Decision::Ignore(IgnoreReason::OutOfOrder {
                latest: latest.timestamp,
            });
        }
        if timestamp == latest.timestamp {
            return Decision::Ignore(IgnoreReason::Conflicting {
                existing: latest.status.clone(),
            });
        }

        match self {
            TransitionPolicy::TimestampMonotonic => Decision::Accept,
            TransitionPolicy::Conventional {
                running_update_window,
            } => conventional(history, latest, status, timestamp, *running_update_window),
        }
    }
}

fn conventional(
    history: &[StateRecord],
    latest: &StateRecord,
    status: &Status,
    timestamp: DateTime<Utc>,
    running_update_window: Duration,
) -> Decision {
    let current = &latest.status;
    let disallowed = || {
        Decision::Ignore(IgnoreReason::Rejected(Rejection::DisallowedTransition {
            from: current.clone(),
            to: status.clone(),
        }))
    };

    if current.is_terminal() {
        if *current == Status::Failed && *status == Status::Resolved {
            return Decision::Accept;
        }
        return Decision::Ignore(IgnoreReason::Rejected(Rejection::TerminalState {
            current: current.clone(),
        }));
    }

    match current {
        // DRAFT may be re-reported with a new payload until READY.
        Status::Draft => {
            return match status {
                Status::Draft | Status::Ready => Decision::Accept,
                _ => disallowed(),
            };
        }
        Status::Ready if matches!(status, Status::Draft | Status::Ready) => return disallowed(),
        Status::Running => match status {
            Status::Draft | Status::Ready => return disallowed(),
            Status::Running => {
                let elapsed = timestamp - latest.timestamp;
                if elapsed < running_update_window {
                    return Decision::Ignore(IgnoreReason::Rejected(
                        Rejection::RunningUpdateTooSoon {
                            elapsed_secs: elapsed.num_seconds(),
                        },
                    ));
                }
                return Decision::Accept;
            }
            _ => {}
        },
        _ => {}
    }

    if *status == Status::Resolved {
        return disallowed();
    }
    if history.iter().any(|r| r.status == *status) {
        return Decision::Ignore(IgnoreReason::Rejected(Rejection::StatusAlreadyRecorded(
            status.clone(),
        )));
    }
    Decision::Accept
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Ignore(IgnoreReason),
}

/// Why a candidate was not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Same status at the same timestamp is already recorded (redelivery).
    Duplicate { record_id: Uuid },
    /// Older than the run's latest state.
    OutOfOrder { latest: DateTime<Utc> },
    /// Same timestamp as the latest state but a different status.
    Conflicting { existing: Status },
    /// Refused by the conventional status rules.
    Rejected(Rejection),
}

impl IgnoreReason {
    /// Out-of-order or conflicting candidates are log-worthy; duplicates are not.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            IgnoreReason::OutOfOrder { .. } | IgnoreReason::Conflicting { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            IgnoreReason::Duplicate { .. } => "duplicate",
            IgnoreReason::OutOfOrder { .. } => "out_of_order",
            IgnoreReason::Conflicting { .. } => "conflicting",
            IgnoreReason::Rejected(_) => "rejected",
        }
    }
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::Duplicate { record_id } => write!(f, "duplicate of record {record_id}"),
            IgnoreReason::OutOfOrder { latest } => {
                write!(f, "older than latest state at {}", latest.to_rfc3339())
            }
            IgnoreReason::Conflicting { existing } => {
                write!(f, "conflicts with {existing} at the same timestamp")
            }
            IgnoreReason::Rejected(rejection) => write!(f, "{rejection}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    TerminalState { current: Status },
    DisallowedTransition { from: Status, to: Status },
    RunningUpdateTooSoon { elapsed_secs: i64 },
    StatusAlreadyRecorded(Status),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::TerminalState { current } => write!(f, "run is in terminal state {current}"),
            Rejection::DisallowedTransition { from, to } => {
                write!(f, "transition {from} -> {to} is not allowed")
            }
            Rejection::RunningUpdateTooSoon { elapsed_secs } => {
                write!(f, "RUNNING update only {elapsed_secs}s after the previous one")
            }
            Rejection::StatusAlreadyRecorded(status) => write!(f, "{status} already recorded"),
        }
    }
}
