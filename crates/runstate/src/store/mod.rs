//! State Store: the append-only ledger of observed run states.
//!
//! ## Conditional Append
//!
//! Every record stored under a portal run id gets the next `seq`. The highest
//! `seq` is the ledger *version*. [`StateStore::append`] only succeeds when the
//! version is still the one the caller read in its [`LedgerSnapshot`];
//! otherwise it returns [`StorageError::Conflict`] and the caller re-reads and
//! re-decides. This keeps accepted timestamps monotonic per run without
//! holding a lock across the decision.
//!
//! There is no update or delete.

mod memory;

pub use memory::MemoryStateStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::core::{LedgerSnapshot, NewStateRecord, RunIdentity, StateRecord, Status};
use crate::error::StorageError;

#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Atomic read of all records under `portal_run_id`, in timestamp order.
    async fn snapshot(&self, portal_run_id: &str) -> Result<LedgerSnapshot, StorageError>;

    /// Append `record` if the ledger version still equals `expected_version`.
    ///
    /// Assigns `id` and `seq = expected_version + 1`.
    async fn append(
        &self,
        record: NewStateRecord,
        expected_version: u64,
    ) -> Result<StateRecord, StorageError>;

    /// Records of one run, ordered by timestamp. Empty when unknown.
    async fn find_by_identity(
        &self,
        identity: &RunIdentity,
    ) -> Result<Vec<StateRecord>, StorageError> {
        Ok(self
            .snapshot(&identity.portal_run_id)
            .await?
            .matching(identity))
    }

    /// Records of a portal run id, optionally narrowed to a status and to a
    /// window around `timestamp`.
    async fn find_by_portal_run_id_status_and_time_window(
        &self,
        portal_run_id: &str,
        status: Option<&Status>,
        timestamp: Option<DateTime<Utc>>,
        window: Duration,
    ) -> Result<Vec<StateRecord>, StorageError> {
        Ok(self
            .snapshot(portal_run_id)
            .await?
            .within_window(status, timestamp, window))
    }
}
