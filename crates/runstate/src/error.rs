//! Error taxonomy.
//!
//! Only [`DecodeError`] and an unresolved [`StorageError`] fail an invocation.
//! An [`EmitError`] after a successful append is reported as an outcome, and a
//! veto is not an error at all.

use std::time::Duration;

/// The inbound event could not be turned into a state change candidate.
///
/// Never retried by the core: the event is unprocessable as delivered.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The envelope itself is not `{source, detail-type, detail}`.
    #[error("invalid event envelope: {0}")]
    Envelope(String),

    /// The envelope carries a detail type this service does not consume.
    #[error("unexpected detail type {actual:?}, expected {expected:?}")]
    UnexpectedDetailType { expected: String, actual: String },

    /// A required detail field is absent or blank.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// The timestamp is not ISO-8601 / RFC 3339.
    #[error("invalid timestamp {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },

    /// The detail is not a state change shape.
    #[error("malformed state change detail: {0}")]
    Detail(#[from] serde_json::Error),
}

/// State Store failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Conditional append lost: the ledger moved past the version that was read.
    #[error("concurrent append on run {portal_run_id}: expected version {expected_version}")]
    Conflict {
        portal_run_id: String,
        expected_version: u64,
    },

    /// The store could not be reached or failed mid-operation.
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    /// A store call exceeded its deadline.
    #[error("state store call timed out after {0:?}")]
    Timeout(Duration),

    /// A constraint other than the append condition was violated.
    #[error("state store constraint violated: {0}")]
    Constraint(String),

    /// Persisted data could not be read back.
    #[error("corrupt state record: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// Whether the gate should re-read and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Conflict { .. } | StorageError::Unavailable(_) | StorageError::Timeout(_)
        )
    }
}

/// Relay failures. Persistence is never rolled back because of these.
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("failed to encode relay event: {0}")]
    Encode(#[from] serde_json::Error),

    /// Bus entries are capped in size; the payload has to shrink.
    #[error("relay event is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("event bus rejected relay: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("event bus call timed out after {0:?}")]
    Timeout(Duration),
}

/// Terminal failure of one processed event.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
