//! Relay outbox for runstate.
//!
//! Every accepted record enters the outbox as pending. It leaves the pending
//! set when it is published or vetoed. A processor configured with an outbox
//! re-publishes a pending record when its event is redelivered, which turns
//! a failed relay into an eventually successful one.
//!
//! # Usage
//!
//! ```rust,ignore
//! use runstate_outbox::MemoryOutbox;
//!
//! let outbox = MemoryOutbox::new();
//! let processor = StateChangeProcessor::new(gate, emitter)
//!     .with_ledger(Arc::new(outbox.clone()));
//!
//! // Records whose relay is still outstanding
//! for entry in outbox.pending() { ... }
//! ```

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use runstate::{Ack, RelayLedger, StateRecord, Status};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RelayState {
    Pending,
    Relayed {
        event_id: String,
        published_at: DateTime<Utc>,
    },
    Vetoed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxEntry {
    pub record_id: Uuid,
    pub portal_run_id: String,
    pub status: Status,
    pub state: RelayState,
    /// Failed publish attempts.
    pub failures: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn is_pending(&self) -> bool {
        self.state == RelayState::Pending
    }
}

/// In-memory outbox.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutbox {
    entries: Arc<DashMap<Uuid, OutboxEntry>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, record_id: Uuid) -> Option<OutboxEntry> {
        self.entries.get(&record_id).map(|e| e.clone())
    }

    /// Pending entries, oldest first.
    pub fn pending(&self) -> Vec<OutboxEntry> {
        let mut pending: Vec<OutboxEntry> = self
            .entries
            .iter()
            .filter(|e| e.is_pending())
            .map(|e| e.clone())
            .collect();
        pending.sort_by_key(|e| e.created_at);
        pending
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop settled entries last touched before `older_than`.
    pub fn purge_settled(&self, older_than: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.is_pending() || e.updated_at >= older_than);
        before - self.entries.len()
    }

    fn update(&self, record_id: Uuid, f: impl FnOnce(&mut OutboxEntry)) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(&record_id)
            .ok_or_else(|| anyhow!("record {record_id} is not in the outbox"))?;
        f(&mut entry);
        entry.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl RelayLedger for MemoryOutbox {
    async fn record_pending(&self, record: &StateRecord) -> Result<()> {
        let now = Utc::now();
        self.entries.entry(record.id).or_insert_with(|| OutboxEntry {
            record_id: record.id,
            portal_run_id: record.identity.portal_run_id.clone(),
            status: record.status.clone(),
            state: RelayState::Pending,
            failures: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        });
        Ok(())
    }

    async fn mark_relayed(&self, record_id: Uuid, ack: &Ack) -> Result<()> {
        self.update(record_id, |e| {
            e.state = RelayState::Relayed {
                event_id: ack.event_id.clone(),
                published_at: ack.published_at,
            };
        })
    }

    async fn mark_vetoed(&self, record_id: Uuid, reason: &str) -> Result<()> {
        self.update(record_id, |e| {
            e.state = RelayState::Vetoed {
                reason: reason.to_string(),
            };
        })
    }

    async fn record_failure(&self, record_id: Uuid, error: &str) -> Result<()> {
        self.update(record_id, |e| {
            e.failures += 1;
            e.last_error = Some(error.to_string());
        })
    }

    async fn is_pending(&self, record_id: Uuid) -> Result<bool> {
        Ok(self
            .entries
            .get(&record_id)
            .map(|e| e.is_pending())
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runstate::{NewStateRecord, RunIdentity, StateChange};

    fn record(portal_run_id: &str) -> StateRecord {
        NewStateRecord::from(StateChange::new(
            RunIdentity::new(portal_run_id, "tumor-normal", "4.2.4"),
            Status::Succeeded,
            Utc::now(),
        ))
        .into_record(1, Utc::now())
    }

    fn ack() -> Ack {
        Ack {
            event_id: "evt-1".into(),
            published_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn pending_until_relayed() {
        let outbox = MemoryOutbox::new();
        let rec = record("PR1");

        outbox.record_pending(&rec).await.unwrap();
        assert!(outbox.is_pending(rec.id).await.unwrap());
        assert_eq!(outbox.pending().len(), 1);

        outbox.mark_relayed(rec.id, &ack()).await.unwrap();
        assert!(!outbox.is_pending(rec.id).await.unwrap());
        assert!(outbox.pending().is_empty());
    }

    #[tokio::test]
    async fn failures_keep_record_pending() {
        let outbox = MemoryOutbox::new();
        let rec = record("PR1");
        outbox.record_pending(&rec).await.unwrap();

        outbox.record_failure(rec.id, "throttled").await.unwrap();
        outbox.record_failure(rec.id, "timed out").await.unwrap();

        let entry = outbox.get(rec.id).unwrap();
        assert!(entry.is_pending());
        assert_eq!(entry.failures, 2);
        assert_eq!(entry.last_error.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn re_recording_does_not_reset_state() {
        let outbox = MemoryOutbox::new();
        let rec = record("PR1");
        outbox.record_pending(&rec).await.unwrap();
        outbox.mark_vetoed(rec.id, "emergency stop").await.unwrap();
        outbox.record_pending(&rec).await.unwrap();

        assert!(matches!(
            outbox.get(rec.id).unwrap().state,
            RelayState::Vetoed { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_records_are_rejected_and_not_pending() {
        let outbox = MemoryOutbox::new();
        let id = Uuid::new_v4();
        assert!(outbox.mark_relayed(id, &ack()).await.is_err());
        assert!(!outbox.is_pending(id).await.unwrap());
    }

    #[tokio::test]
    async fn purge_keeps_pending_entries() {
        let outbox = MemoryOutbox::new();
        let done = record("PR1");
        let waiting = record("PR2");
        outbox.record_pending(&done).await.unwrap();
        outbox.record_pending(&waiting).await.unwrap();
        outbox.mark_relayed(done.id, &ack()).await.unwrap();

        let purged = outbox.purge_settled(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(purged, 1);
        assert_eq!(outbox.len(), 1);
        assert!(outbox.get(waiting.id).is_some());
    }
}
