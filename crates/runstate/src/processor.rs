//! Processor: one inbound event through decode, gate, hooks and relay.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::core::{Run, StateChange, StateRecord};
use crate::envelope::EnvelopeCodec;
use crate::error::{EmitError, ProcessError};
use crate::gate::{GateOutcome, TransitionGate};
use crate::hooks::{EmergencyStopRule, HookChain, HookVerdict, ParameterDenylist, ParameterSource};
use crate::policy::IgnoreReason;
use crate::relay::{Ack, EventBus, NoOpRelayLedger, RelayEmitter, RelayLedger};
use crate::store::StateStore;

/// Result of processing one event that did not fail the invocation.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Persisted and published.
    Relayed { record: StateRecord, ack: Ack },
    /// Persisted; a business rule suppressed the relay.
    Vetoed { record: StateRecord, reason: String },
    /// Nothing persisted, nothing published.
    Ignored { reason: IgnoreReason },
    /// Persisted; publishing failed. The record stays.
    RelayFailed { record: StateRecord, error: EmitError },
}

impl ProcessOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessOutcome::Relayed { .. } => "relayed",
            ProcessOutcome::Vetoed { .. } => "vetoed",
            ProcessOutcome::Ignored { .. } => "ignored",
            ProcessOutcome::RelayFailed { .. } => "relay_failed",
        }
    }

    pub fn record(&self) -> Option<&StateRecord> {
        match self {
            ProcessOutcome::Relayed { record, .. }
            | ProcessOutcome::Vetoed { record, .. }
            | ProcessOutcome::RelayFailed { record, .. } => Some(record),
            ProcessOutcome::Ignored { .. } => None,
        }
    }

    pub fn is_relayed(&self) -> bool {
        matches!(self, ProcessOutcome::Relayed { .. })
    }
}

pub struct StateChangeProcessor {
    codec: EnvelopeCodec,
    gate: TransitionGate,
    hooks: HookChain,
    emitter: RelayEmitter,
    ledger: Arc<dyn RelayLedger>,
    concurrency: usize,
}

impl StateChangeProcessor {
    pub fn new(gate: TransitionGate, emitter: RelayEmitter) -> Self {
        Self {
            codec: emitter.codec().clone(),
            gate,
            hooks: HookChain::new(),
            emitter,
            ledger: Arc::new(NoOpRelayLedger),
            concurrency: 8,
        }
    }

    /// Wire a processor from configuration.
    ///
    /// The emergency stop rule is installed when the denylist is enabled and
    /// a parameter source is given.
    pub fn from_config(
        config: &RelayConfig,
        store: Arc<dyn StateStore>,
        bus: Arc<dyn EventBus>,
        parameters: Option<Arc<dyn ParameterSource>>,
    ) -> Self {
        let gate = TransitionGate::new(store)
            .with_policy(config.gate.transition_policy())
            .with_identity_window(config.gate.identity_window())
            .with_retry(config.gate.retry_policy())
            .with_store_timeout(config.timeouts.store());
        let emitter = RelayEmitter::new(EnvelopeCodec::new(config.service.profile()), bus)
            .with_timeout(config.timeouts.emit())
            .with_max_batch(config.relay.max_batch)
            .with_max_event_bytes(config.relay.max_event_bytes);

        let mut hooks = HookChain::new();
        match parameters {
            Some(source) if config.denylist.enabled => {
                let denylist = ParameterDenylist::new(source)
                    .with_parameter_name(config.denylist.parameter_name.clone());
                hooks = hooks.with_rule(EmergencyStopRule::new(Arc::new(denylist)));
            }
            None if config.denylist.enabled => {
                warn!("emergency stop denylist enabled but no parameter source configured");
            }
            _ => {}
        }

        Self::new(gate, emitter)
            .with_hooks(hooks)
            .with_concurrency(config.relay.concurrency)
    }

    pub fn with_hooks(mut self, hooks: HookChain) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn RelayLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn gate(&self) -> &TransitionGate {
        &self.gate
    }

    /// Process one raw bus event.
    pub async fn process(&self, raw: &Value) -> Result<ProcessOutcome, ProcessError> {
        let (change, span) = self.decode(raw)?;
        self.process_change(change).instrument(span).await
    }

    async fn process_change(&self, change: StateChange) -> Result<ProcessOutcome, ProcessError> {
        match self.stage(change).await? {
            Staged::Done(outcome) => Ok(outcome),
            Staged::Publish(record) => {
                let result = self.emitter.emit(&record).await;
                Ok(self.settle(record, result).await)
            }
        }
    }

    /// Process a batch. Results are in input order.
    ///
    /// Events are gated concurrently; the records left to publish then go
    /// out together through [`RelayEmitter::emit_batch`].
    pub async fn process_batch(
        &self,
        raws: &[Value],
    ) -> Vec<Result<ProcessOutcome, ProcessError>> {
        let staged: Vec<Result<Staged, ProcessError>> =
            stream::iter(raws.iter().map(|raw| self.stage_raw(raw)))
                .buffered(self.concurrency)
                .collect()
                .await;

        let mut records = Vec::new();
        let slots: Vec<Option<Result<ProcessOutcome, ProcessError>>> = staged
            .into_iter()
            .map(|item| match item {
                Ok(Staged::Publish(record)) => {
                    records.push(record);
                    None
                }
                Ok(Staged::Done(outcome)) => Some(Ok(outcome)),
                Err(err) => Some(Err(err)),
            })
            .collect();

        let sent = self
            .emitter
            .emit_batch(&records)
            .instrument(info_span!("runstate.relay_batch", events = records.len()))
            .await;
        let mut published = records.into_iter().zip(sent);

        let mut results = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Some(done) => results.push(done),
                None => {
                    if let Some((record, result)) = published.next() {
                        results.push(Ok(self.settle(record, result).await));
                    }
                }
            }
        }
        results
    }

    fn decode(&self, raw: &Value) -> Result<(StateChange, Span), ProcessError> {
        let change = self.codec.decode(raw).map_err(|err| {
            warn!(error = %err, "undecodable state change event");
            err
        })?;
        let span = info_span!(
            "runstate.process",
            portal_run_id = %change.portal_run_id(),
            status = %change.status,
            timestamp = %change.timestamp,
        );
        Ok((change, span))
    }

    async fn stage_raw(&self, raw: &Value) -> Result<Staged, ProcessError> {
        let (change, span) = self.decode(raw)?;
        self.stage(change).instrument(span).await
    }

    /// Gate and hooks: everything up to publishing.
    async fn stage(&self, change: StateChange) -> Result<Staged, ProcessError> {
        match self.gate.submit(change).await? {
            GateOutcome::Accepted { record, run } => {
                if let Err(err) = self.ledger.record_pending(&record).await {
                    warn!(record_id = %record.id, error = %err, "relay ledger unavailable");
                }
                Ok(self.screen(run, record).await)
            }
            GateOutcome::Ignored {
                reason: IgnoreReason::Duplicate { record_id },
                run,
            } => Ok(self.redeliver(record_id, run).await),
            GateOutcome::Ignored { reason, .. } => {
                Ok(Staged::Done(ProcessOutcome::Ignored { reason }))
            }
        }
    }

    /// A duplicate whose record was never published is relayed again.
    async fn redeliver(&self, record_id: Uuid, run: Run) -> Staged {
        let ignored = Staged::Done(ProcessOutcome::Ignored {
            reason: IgnoreReason::Duplicate { record_id },
        });
        let pending = match self.ledger.is_pending(record_id).await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(record_id = %record_id, error = %err, "relay ledger unavailable");
                false
            }
        };
        if !pending {
            return ignored;
        }
        match run.history().iter().find(|r| r.id == record_id).cloned() {
            Some(record) => {
                info!(record_id = %record_id, "re-relaying pending record on redelivery");
                self.screen(run, record).await
            }
            None => ignored,
        }
    }

    async fn screen(&self, run: Run, record: StateRecord) -> Staged {
        if let HookVerdict::Veto(reason) = self.hooks.evaluate(&run, &record).await {
            info!(record_id = %record.id, reason = %reason, "relay vetoed");
            if let Err(err) = self.ledger.mark_vetoed(record.id, &reason).await {
                warn!(record_id = %record.id, error = %err, "relay ledger unavailable");
            }
            return Staged::Done(ProcessOutcome::Vetoed { record, reason });
        }
        Staged::Publish(record)
    }

    async fn settle(&self, record: StateRecord, result: Result<Ack, EmitError>) -> ProcessOutcome {
        match result {
            Ok(ack) => {
                if let Err(err) = self.ledger.mark_relayed(record.id, &ack).await {
                    warn!(record_id = %record.id, error = %err, "relay ledger unavailable");
                }
                ProcessOutcome::Relayed { record, ack }
            }
            Err(error) => {
                warn!(record_id = %record.id, error = %error, "relay failed, record kept");
                if let Err(err) = self.ledger.record_failure(record.id, &error.to_string()).await {
                    warn!(record_id = %record.id, error = %err, "relay ledger unavailable");
                }
                ProcessOutcome::RelayFailed { record, error }
            }
        }
    }
}

/// Where an event stands once gating and hooks are done.
enum Staged {
    Done(ProcessOutcome),
    Publish(StateRecord),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventEnvelope;
    use crate::error::DecodeError;
    use crate::store::MemoryStateStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Bus(Mutex<Vec<EventEnvelope>>, AtomicUsize);

    #[async_trait]
    impl EventBus for Bus {
        async fn put_events(&self, events: &[EventEnvelope]) -> anyhow::Result<()> {
            self.1.fetch_add(1, Ordering::SeqCst);
            self.0.lock().unwrap().extend_from_slice(events);
            Ok(())
        }
    }

    fn event(status: &str, timestamp: &str) -> Value {
        json!({
            "source": "orcabus.bclconvertmanager",
            "detail-type": "WorkflowRunStateChange",
            "detail": {
                "portalRunId": "20250501abcdef01",
                "executionId": "icav2.exec.1",
                "timestamp": timestamp,
                "status": status,
                "workflowName": "BclConvert",
                "workflowVersion": "4.2.7",
                "workflowRunName": "umccr--automated--bclconvert--4-2-7--20250501abcdef01"
            }
        })
    }

    fn processor(bus: Arc<Bus>) -> StateChangeProcessor {
        let gate = TransitionGate::new(Arc::new(MemoryStateStore::new()));
        StateChangeProcessor::new(gate, RelayEmitter::new(EnvelopeCodec::default(), bus))
    }

    #[tokio::test]
    async fn accepted_change_is_relayed_under_own_namespace() {
        let bus = Arc::new(Bus::default());
        let processor = processor(bus.clone());

        let outcome = processor
            .process(&event("RUNNING", "2025-05-01T10:00:00Z"))
            .await
            .unwrap();
        assert!(outcome.is_relayed());

        let published = bus.0.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].source, "orcabus.workflowmanager");
        assert_eq!(published[0].detail["status"], "RUNNING");
    }

    #[tokio::test]
    async fn redelivery_is_ignored_without_ledger() {
        let bus = Arc::new(Bus::default());
        let processor = processor(bus.clone());
        let raw = event("RUNNING", "2025-05-01T10:00:00Z");

        processor.process(&raw).await.unwrap();
        let again = processor.process(&raw).await.unwrap();
        assert!(matches!(
            again,
            ProcessOutcome::Ignored { reason: IgnoreReason::Duplicate { .. } }
        ));
        assert_eq!(bus.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_event_fails_the_invocation() {
        let processor = processor(Arc::new(Bus::default()));
        let err = processor
            .process(&json!({"source": "x", "detail-type": "y", "detail": {"status": "RUNNING"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Decode(DecodeError::MissingField(_))));
    }

    #[tokio::test]
    async fn batch_results_keep_input_order() {
        let bus = Arc::new(Bus::default());
        let processor = processor(bus.clone()).with_concurrency(4);
        let raws = vec![
            event("DRAFT", "2025-05-01T09:00:00Z"),
            json!({"not": "an envelope"}),
            event("DRAFT", "2025-05-01T09:00:00Z"),
        ];

        let results = processor.process_batch(&raws).await;
        assert_eq!(results.len(), 3);
        assert!(results[1].is_err());
        let relayed = results
            .iter()
            .filter(|r| matches!(r, Ok(o) if o.is_relayed()))
            .count();
        assert_eq!(relayed, 1);
        assert_eq!(bus.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn batch_relays_in_bus_sized_chunks() {
        let bus = Arc::new(Bus::default());
        let gate = TransitionGate::new(Arc::new(MemoryStateStore::new()));
        let emitter = RelayEmitter::new(EnvelopeCodec::default(), bus.clone()).with_max_batch(2);
        let processor = StateChangeProcessor::new(gate, emitter).with_concurrency(1);
        let raws: Vec<Value> = ["DRAFT", "READY", "RUNNING", "SUCCEEDED", "READY"]
            .iter()
            .enumerate()
            .map(|(i, status)| event(status, &format!("2025-05-01T09:0{i}:00Z")))
            .chain(std::iter::once(event("DRAFT", "2025-05-01T09:00:00Z")))
            .collect();

        let results = processor.process_batch(&raws).await;
        assert_eq!(results.len(), 6);
        assert!(matches!(
            results[5],
            Ok(ProcessOutcome::Ignored { reason: IgnoreReason::Duplicate { .. } })
        ));
        let relayed = results
            .iter()
            .filter(|r| matches!(r, Ok(o) if o.is_relayed()))
            .count();
        assert_eq!(relayed, 5);
        // Five events in chunks of two.
        assert_eq!(bus.1.load(Ordering::SeqCst), 3);
        assert_eq!(bus.0.lock().unwrap().len(), 5);
    }
}
