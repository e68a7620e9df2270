//! Relay Emitter: publishes accepted records under the service's namespace.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::StateRecord;
use crate::envelope::{EnvelopeCodec, EventEnvelope};
use crate::error::EmitError;

/// Largest entry the bus accepts, in bytes.
pub const MAX_EVENT_BYTES: usize = 256 * 1024;

/// Most entries accepted by one `put_events` call.
pub const MAX_BATCH: usize = 10;

/// Outbound event bus.
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    async fn put_events(&self, events: &[EventEnvelope]) -> anyhow::Result<()>;
}

/// Acknowledgement of a published relay event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub event_id: String,
    pub published_at: DateTime<Utc>,
}

impl Ack {
    fn for_envelope(envelope: &EventEnvelope) -> Self {
        Self {
            event_id: envelope.id.clone().unwrap_or_default(),
            published_at: Utc::now(),
        }
    }
}

pub struct RelayEmitter {
    codec: EnvelopeCodec,
    bus: Arc<dyn EventBus>,
    timeout: Duration,
    max_batch: usize,
    max_event_bytes: usize,
}

impl RelayEmitter {
    pub fn new(codec: EnvelopeCodec, bus: Arc<dyn EventBus>) -> Self {
        Self {
            codec,
            bus,
            timeout: Duration::from_secs(5),
            max_batch: MAX_BATCH,
            max_event_bytes: MAX_EVENT_BYTES,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.clamp(1, MAX_BATCH);
        self
    }

    pub fn with_max_event_bytes(mut self, limit: usize) -> Self {
        self.max_event_bytes = limit;
        self
    }

    pub fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    /// Publish one record.
    pub async fn emit(&self, record: &StateRecord) -> Result<Ack, EmitError> {
        let envelope = self.prepare(record)?;
        self.publish(std::slice::from_ref(&envelope)).await?;
        info!(
            portal_run_id = %record.identity.portal_run_id,
            status = %record.status,
            event_id = envelope.id.as_deref().unwrap_or_default(),
            "state change relayed"
        );
        Ok(Ack::for_envelope(&envelope))
    }

    /// Publish many records in bus-sized chunks.
    ///
    /// Results are in input order. A failed chunk fails every record in it;
    /// other chunks are still attempted.
    pub async fn emit_batch(&self, records: &[StateRecord]) -> Vec<Result<Ack, EmitError>> {
        let prepared: Vec<Result<EventEnvelope, EmitError>> =
            records.iter().map(|r| self.prepare(r)).collect();
        let ready: Vec<EventEnvelope> = prepared
            .iter()
            .filter_map(|p| p.as_ref().ok().cloned())
            .collect();

        let mut chunk_results = Vec::with_capacity(ready.len().div_ceil(self.max_batch));
        for chunk in ready.chunks(self.max_batch) {
            let result = self.publish(chunk).await;
            if result.is_ok() {
                info!(events = chunk.len(), "state changes relayed");
            }
            chunk_results.push(result);
        }

        let mut results = Vec::with_capacity(prepared.len());
        let mut position = 0;
        for item in prepared {
            results.push(match item {
                Err(err) => Err(err),
                Ok(envelope) => {
                    let chunk = &chunk_results[position / self.max_batch];
                    position += 1;
                    match chunk {
                        Ok(()) => Ok(Ack::for_envelope(&envelope)),
                        Err(err) => Err(replicate(err)),
                    }
                }
            });
        }
        results
    }

    fn prepare(&self, record: &StateRecord) -> Result<EventEnvelope, EmitError> {
        let envelope = self.codec.encode(record)?;
        let size = serde_json::to_vec(&envelope)?.len();
        if size > self.max_event_bytes {
            return Err(EmitError::TooLarge {
                size,
                limit: self.max_event_bytes,
            });
        }
        Ok(envelope)
    }

    async fn publish(&self, envelopes: &[EventEnvelope]) -> Result<(), EmitError> {
        let result = tokio::time::timeout(self.timeout, self.bus.put_events(envelopes))
            .await
            .map_err(|_| EmitError::Timeout(self.timeout))?
            .map_err(EmitError::Transport);
        if let Err(err) = &result {
            warn!(events = envelopes.len(), error = %err, "event bus publish failed");
        }
        result
    }
}

/// Copy a chunk-level failure onto each record of the chunk.
fn replicate(err: &EmitError) -> EmitError {
    match err {
        EmitError::Timeout(d) => EmitError::Timeout(*d),
        EmitError::TooLarge { size, limit } => EmitError::TooLarge {
            size: *size,
            limit: *limit,
        },
        other => EmitError::Transport(anyhow::anyhow!("{other:#}")),
    }
}

/// Bookkeeping of which accepted records still await relay.
///
/// With a ledger configured, a redelivered event whose record is still
/// pending is relayed again.
#[async_trait]
pub trait RelayLedger: Send + Sync + 'static {
    async fn record_pending(&self, record: &StateRecord) -> anyhow::Result<()>;

    async fn mark_relayed(&self, record_id: Uuid, ack: &Ack) -> anyhow::Result<()>;

    async fn mark_vetoed(&self, record_id: Uuid, reason: &str) -> anyhow::Result<()>;

    /// A relay attempt failed; the record stays pending.
    async fn record_failure(&self, record_id: Uuid, error: &str) -> anyhow::Result<()>;

    async fn is_pending(&self, record_id: Uuid) -> anyhow::Result<bool>;
}

/// Ledger that tracks nothing. Redeliveries are never re-relayed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpRelayLedger;

#[async_trait]
impl RelayLedger for NoOpRelayLedger {
    async fn record_pending(&self, _record: &StateRecord) -> anyhow::Result<()> {
        Ok(())
    }

    async fn mark_relayed(&self, _record_id: Uuid, _ack: &Ack) -> anyhow::Result<()> {
        Ok(())
    }

    async fn mark_vetoed(&self, _record_id: Uuid, _reason: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn record_failure(&self, _record_id: Uuid, _error: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn is_pending(&self, _record_id: Uuid) -> anyhow::Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NewStateRecord, RunIdentity, StateChange, Status};
    use crate::envelope::ServiceProfile;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Bus {
        calls: Mutex<Vec<usize>>,
        fail_call: Option<usize>,
        delay: Option<Duration>,
        seen: AtomicUsize,
    }

    #[async_trait]
    impl EventBus for Bus {
        async fn put_events(&self, events: &[EventEnvelope]) -> anyhow::Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let call = self.seen.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(events.len());
            if self.fail_call == Some(call) {
                anyhow::bail!("throttled");
            }
            Ok(())
        }
    }

    fn record(n: u64) -> StateRecord {
        NewStateRecord::from(StateChange::new(
            RunIdentity::new(format!("PR{n}"), "wgs", "1.0"),
            Status::Running,
            Utc::now(),
        ))
        .into_record(1, Utc::now())
    }

    #[tokio::test]
    async fn emit_publishes_one_envelope() {
        let bus = Arc::new(Bus::default());
        let emitter = RelayEmitter::new(EnvelopeCodec::new(ServiceProfile::case_manager()), bus.clone());

        let ack = emitter.emit(&record(1)).await.unwrap();
        assert!(!ack.event_id.is_empty());
        assert_eq!(*bus.calls.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn oversized_payload_is_refused_before_publish() {
        let bus = Arc::new(Bus::default());
        let emitter = RelayEmitter::new(EnvelopeCodec::default(), bus.clone()).with_max_event_bytes(512);

        let mut big = record(1);
        big.payload = Some(crate::core::Payload::from_data(crate::core::PayloadData {
            version: "1".into(),
            data: json!({ "blob": "x".repeat(1024) }),
        }));
        let err = emitter.emit(&big).await.unwrap_err();
        assert!(matches!(err, EmitError::TooLarge { limit: 512, .. }));
        assert!(bus.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn slow_bus_times_out() {
        let bus = Arc::new(Bus {
            delay: Some(Duration::from_millis(200)),
            ..Bus::default()
        });
        let emitter =
            RelayEmitter::new(EnvelopeCodec::default(), bus).with_timeout(Duration::from_millis(10));
        assert!(matches!(
            emitter.emit(&record(1)).await,
            Err(EmitError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn batch_is_chunked_and_failures_stay_in_their_chunk() {
        let bus = Arc::new(Bus {
            fail_call: Some(1),
            ..Bus::default()
        });
        let emitter = RelayEmitter::new(EnvelopeCodec::default(), bus.clone());

        let records: Vec<StateRecord> = (0..23).map(record).collect();
        let results = emitter.emit_batch(&records).await;

        assert_eq!(*bus.calls.lock().unwrap(), vec![10, 10, 3]);
        assert_eq!(results.len(), 23);
        assert!(results[..10].iter().all(Result::is_ok));
        assert!(results[10..20]
            .iter()
            .all(|r| matches!(r, Err(EmitError::Transport(_)))));
        assert!(results[20..].iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn noop_ledger_never_reports_pending() {
        let ledger = NoOpRelayLedger;
        let rec = record(1);
        ledger.record_pending(&rec).await.unwrap();
        assert!(!ledger.is_pending(rec.id).await.unwrap());
    }
}
