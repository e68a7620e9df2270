//! Testing utilities for runstate.
//!
//! Fakes for every collaborator seam (event bus, denylist, parameter store,
//! state store) plus a builder for raw inbound events.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use runstate::{
    generate_portal_run_id, DenylistLookup, EventBus, EventEnvelope, LedgerSnapshot,
    MemoryStateStore, NewStateRecord, ParameterSource, StateRecord, StateStore, StorageError,
    WORKFLOW_RUN_STATE_CHANGE,
};
use serde_json::{json, Map, Value};

// ============================================================================
// Event buses
// ============================================================================

/// Records every published envelope.
#[derive(Debug, Clone, Default)]
pub struct RecordingBus {
    events: Arc<Mutex<Vec<EventEnvelope>>>,
    calls: Arc<AtomicUsize>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `put_events` invocations.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Relayed statuses in publish order.
    pub fn statuses(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e.detail.get("status").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }
}

#[async_trait]
impl EventBus for RecordingBus {
    async fn put_events(&self, events: &[EventEnvelope]) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("recording bus poisoned"))?
            .extend_from_slice(events);
        Ok(())
    }
}

/// Rejects every publish.
#[derive(Debug, Clone)]
pub struct FailingBus {
    message: String,
}

impl FailingBus {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for FailingBus {
    fn default() -> Self {
        Self::new("event bus unavailable")
    }
}

#[async_trait]
impl EventBus for FailingBus {
    async fn put_events(&self, _events: &[EventEnvelope]) -> anyhow::Result<()> {
        anyhow::bail!("{}", self.message)
    }
}

/// Fails the first `failures` publishes, then records like [`RecordingBus`].
#[derive(Debug, Clone)]
pub struct FlakyBus {
    remaining_failures: Arc<AtomicU32>,
    recorder: RecordingBus,
}

impl FlakyBus {
    pub fn new(failures: u32) -> Self {
        Self {
            remaining_failures: Arc::new(AtomicU32::new(failures)),
            recorder: RecordingBus::new(),
        }
    }

    pub fn recorder(&self) -> &RecordingBus {
        &self.recorder
    }
}

#[async_trait]
impl EventBus for FlakyBus {
    async fn put_events(&self, events: &[EventEnvelope]) -> anyhow::Result<()> {
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("throttled");
        }
        self.recorder.put_events(events).await
    }
}

// ============================================================================
// Denylists and parameters
// ============================================================================

/// Fixed set of denylisted run identifiers.
#[derive(Debug, Clone, Default)]
pub struct StaticDenylist {
    entries: HashSet<String>,
}

impl StaticDenylist {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl DenylistLookup for StaticDenylist {
    async fn is_denylisted(&self, run_identifier: &str) -> anyhow::Result<bool> {
        Ok(self.entries.contains(run_identifier))
    }
}

/// Denylist whose backing service is down.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingDenylist;

#[async_trait]
impl DenylistLookup for FailingDenylist {
    async fn is_denylisted(&self, _run_identifier: &str) -> anyhow::Result<bool> {
        anyhow::bail!("parameter store unreachable")
    }
}

/// In-memory parameter store.
#[derive(Debug, Clone, Default)]
pub struct StaticParameters {
    values: HashMap<String, String>,
}

impl StaticParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl ParameterSource for StaticParameters {
    async fn get_parameter(&self, name: &str) -> anyhow::Result<String> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("parameter {name} not found"))
    }
}

// ============================================================================
// State stores
// ============================================================================

/// Wraps a [`MemoryStateStore`] and fails the next `conflicts` appends with a
/// conflict, without writing.
#[derive(Debug, Clone)]
pub struct ConflictInjectingStore {
    inner: MemoryStateStore,
    remaining: Arc<AtomicU32>,
    appends: Arc<AtomicUsize>,
}

impl ConflictInjectingStore {
    pub fn new(conflicts: u32) -> Self {
        Self::wrap(MemoryStateStore::new(), conflicts)
    }

    pub fn wrap(inner: MemoryStateStore, conflicts: u32) -> Self {
        Self {
            inner,
            remaining: Arc::new(AtomicU32::new(conflicts)),
            appends: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn inner(&self) -> &MemoryStateStore {
        &self.inner
    }

    /// Append calls seen, including the failed ones.
    pub fn append_attempts(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for ConflictInjectingStore {
    async fn snapshot(&self, portal_run_id: &str) -> Result<LedgerSnapshot, StorageError> {
        self.inner.snapshot(portal_run_id).await
    }

    async fn append(
        &self,
        record: NewStateRecord,
        expected_version: u64,
    ) -> Result<StateRecord, StorageError> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        let inject = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if inject {
            return Err(StorageError::Conflict {
                portal_run_id: record.identity.portal_run_id,
                expected_version,
            });
        }
        self.inner.append(record, expected_version).await
    }
}

/// Wraps a [`MemoryStateStore`] and stalls selected calls once.
///
/// A stalled append is applied before the stall, so a caller that gives up
/// waiting leaves the record behind.
#[derive(Debug, Clone, Default)]
pub struct StallingStore {
    inner: MemoryStateStore,
    snapshot_stall_ms: Arc<AtomicU64>,
    append_stall_ms: Arc<AtomicU64>,
}

impl StallingStore {
    pub fn wrap(inner: MemoryStateStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn inner(&self) -> &MemoryStateStore {
        &self.inner
    }

    pub fn stall_next_snapshot(&self, delay: Duration) {
        self.snapshot_stall_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn stall_next_append(&self, delay: Duration) {
        self.append_stall_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

async fn stall(slot: &AtomicU64) {
    let ms = slot.swap(0, Ordering::SeqCst);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl StateStore for StallingStore {
    async fn snapshot(&self, portal_run_id: &str) -> Result<LedgerSnapshot, StorageError> {
        stall(&self.snapshot_stall_ms).await;
        self.inner.snapshot(portal_run_id).await
    }

    async fn append(
        &self,
        record: NewStateRecord,
        expected_version: u64,
    ) -> Result<StateRecord, StorageError> {
        let stored = self.inner.append(record, expected_version).await?;
        stall(&self.append_stall_ms).await;
        Ok(stored)
    }
}

// ============================================================================
// Event builder
// ============================================================================

/// Builds raw inbound `WorkflowRunStateChange` events.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    source: String,
    detail_type: String,
    detail: Map<String, Value>,
}

impl EventBuilder {
    pub fn new(portal_run_id: &str) -> Self {
        let mut detail = Map::new();
        detail.insert("portalRunId".into(), json!(portal_run_id));
        detail.insert("workflowName".into(), json!("BclConvert"));
        detail.insert("workflowVersion".into(), json!("4.2.7"));
        detail.insert("status".into(), json!("DRAFT"));
        detail.insert("timestamp".into(), json!("2025-05-01T09:00:00Z"));
        Self {
            source: "orcabus.bclconvertmanager".to_string(),
            detail_type: WORKFLOW_RUN_STATE_CHANGE.to_string(),
            detail,
        }
    }

    /// Event for a run with a freshly generated portal run id.
    pub fn for_new_run() -> Self {
        Self::new(&generate_portal_run_id())
    }

    pub fn portal_run_id(&self) -> Option<&str> {
        self.detail.get("portalRunId").and_then(Value::as_str)
    }

    pub fn source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    pub fn detail_type(mut self, detail_type: &str) -> Self {
        self.detail_type = detail_type.to_string();
        self
    }

    pub fn status(self, status: &str) -> Self {
        self.field("status", json!(status))
    }

    pub fn timestamp(self, timestamp: &str) -> Self {
        self.field("timestamp", json!(timestamp))
    }

    pub fn at(self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp(&timestamp.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn workflow(self, name: &str, version: &str) -> Self {
        self.field("workflowName", json!(name))
            .field("workflowVersion", json!(version))
    }

    pub fn execution_id(self, execution_id: &str) -> Self {
        self.field("executionId", json!(execution_id))
    }

    pub fn payload(self, version: &str, data: Value) -> Self {
        self.field("payload", json!({ "version": version, "data": data }))
    }

    pub fn field(mut self, key: &str, value: Value) -> Self {
        self.detail.insert(key.to_string(), value);
        self
    }

    pub fn without(mut self, key: &str) -> Self {
        self.detail.remove(key);
        self
    }

    pub fn build(self) -> Value {
        json!({
            "source": self.source,
            "detail-type": self.detail_type,
            "detail": Value::Object(self.detail),
        })
    }
}
