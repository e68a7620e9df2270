//! # runstate
//!
//! Deduplicate, persist and relay workflow run state changes.
//!
//! Execution engines report run state changes on a shared event bus. They
//! retry, they race, and the bus redelivers. This crate accepts each change at
//! most once per run, keeps the run's history append-only, and re-broadcasts
//! accepted changes under the manager service's own namespace.
//!
//! ## Architecture
//!
//! ```text
//! raw bus event
//!     │
//!     ▼ EnvelopeCodec::decode()
//! StateChange ──────────────────────────────────────────┐
//!     │                                                 │
//!     ▼ TransitionGate::submit()                        │
//! StateStore::snapshot(portal_run_id)                   │
//!     │                                                 │
//!     ├─► TransitionPolicy::decide() ─► Ignore ─────────┼─► Ignored
//!     │                                                 │
//!     └─► Accept ─► StateStore::append(expected_version)│
//!                      │            │                   │
//!                      │            └─► Conflict ───────┘ (re-read, retry)
//!                      ▼
//!                HookChain::evaluate() ─► Veto ──────────► Vetoed
//!                      │
//!                      ▼
//!                RelayEmitter::emit() ─► EmitError ──────► RelayFailed
//!                      │
//!                      ▼
//!                   Relayed
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Records are immutable** - the store only appends
//! 2. **Timestamps decide** - a run's current state is its latest-timestamped
//!    record, never its latest inserted one
//! 3. **Accepted timestamps strictly increase per run**, even under concurrent
//!    delivery, through the store's conditional append
//! 4. **Redelivery is idempotent** - the same status at the same timestamp is
//!    stored once
//! 5. **Persistence is never rolled back** - vetoes and relay failures only
//!    affect publishing
//!
//! ## Guarantees
//!
//! - **Exactly-once persistence** per (identity, status, timestamp)
//! - **At-least-once relay** when a [`RelayLedger`] is configured; otherwise a
//!   failed relay is reported and not retried on redelivery
//! - **No ordering across runs**
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use runstate::{MemoryStateStore, RelayConfig, StateChangeProcessor};
//!
//! let config = RelayConfig::load()?;
//! let processor = StateChangeProcessor::from_config(
//!     &config,
//!     Arc::new(MemoryStateStore::new()),
//!     Arc::new(my_bus),
//!     Some(Arc::new(my_parameter_store)),
//! );
//!
//! match processor.process(&raw_event).await? {
//!     ProcessOutcome::Relayed { record, ack } => { /* published */ }
//!     ProcessOutcome::Ignored { reason } => { /* duplicate, stale, ... */ }
//!     ProcessOutcome::Vetoed { .. } | ProcessOutcome::RelayFailed { .. } => { /* stored only */ }
//! }
//! ```

// Core modules
mod core;
mod error;

pub mod config;
pub mod envelope;
pub mod gate;
pub mod hooks;
pub mod policy;
pub mod portal_run_id;
pub mod processor;
pub mod relay;
pub mod store;

// Re-export the data model
pub use crate::core::{
    sort_records, LedgerSnapshot, LinkedLibrary, NewStateRecord, Payload, PayloadData, Run,
    RunIdentity, StateChange, StateRecord, Status,
};

// Re-export error types
pub use crate::error::{DecodeError, EmitError, ProcessError, StorageError};

// Re-export codec types
pub use envelope::{
    EnvelopeCodec, EventEnvelope, RunKind, ServiceProfile, CASE_MANAGER_NAMESPACE,
    CASE_RUN_STATE_CHANGE, WORKFLOW_MANAGER_NAMESPACE, WORKFLOW_RUN_STATE_CHANGE,
};

// Re-export store types
pub use store::{MemoryStateStore, StateStore};

// Re-export gate and policy types
pub use gate::{GateOutcome, RetryPolicy, TransitionGate};
pub use policy::{Decision, IgnoreReason, Rejection, TransitionPolicy};

// Re-export hook types
pub use hooks::{
    BusinessRule, DenylistLookup, EmergencyStopRule, HookChain, HookVerdict, ParameterDenylist,
    ParameterSource,
};

// Re-export relay types
pub use relay::{Ack, EventBus, NoOpRelayLedger, RelayEmitter, RelayLedger};

// Re-export the processor (primary entry point)
pub use processor::{ProcessOutcome, StateChangeProcessor};

pub use config::RelayConfig;
pub use portal_run_id::generate_portal_run_id;

// Re-export commonly used external types
pub use async_trait::async_trait;
