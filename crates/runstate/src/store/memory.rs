use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use smallvec::SmallVec;

use super::StateStore;
use crate::core::{LedgerSnapshot, NewStateRecord, StateRecord};
use crate::error::StorageError;

/// Most runs see a handful of states (DRAFT, READY, RUNNING, terminal).
type Ledger = SmallVec<[StateRecord; 8]>;

/// In-process store. Clones share the same ledgers.
///
/// The compare-and-append runs under the map entry's write lock.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    ledgers: Arc<DashMap<String, Ledger>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self, portal_run_id: &str) -> usize {
        self.ledgers
            .get(portal_run_id)
            .map(|ledger| ledger.len())
            .unwrap_or(0)
    }

    pub fn run_count(&self) -> usize {
        self.ledgers.iter().filter(|l| !l.is_empty()).count()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn snapshot(&self, portal_run_id: &str) -> Result<LedgerSnapshot, StorageError> {
        Ok(match self.ledgers.get(portal_run_id) {
            Some(ledger) => LedgerSnapshot::from_records(portal_run_id, ledger.to_vec()),
            None => LedgerSnapshot::empty(portal_run_id),
        })
    }

    async fn append(
        &self,
        record: NewStateRecord,
        expected_version: u64,
    ) -> Result<StateRecord, StorageError> {
        let portal_run_id = record.identity.portal_run_id.clone();
        let mut ledger = self.ledgers.entry(portal_run_id.clone()).or_default();

        let version = ledger.last().map(|r| r.seq).unwrap_or(0);
        if version != expected_version {
            return Err(StorageError::Conflict {
                portal_run_id,
                expected_version,
            });
        }

        let stored = record.into_record(version + 1, Utc::now());
        ledger.push(stored.clone());
        Ok(stored)
    }
}
