//! # Replay
//!
//! Feeds newline-delimited bus events through the runstate processor and
//! prints every relayed event to stdout.
//!
//! ```text
//! runstate-replay events.ndjson --store state.jsonl --denylist stop.json
//! ```
//!
//! Replaying the same file twice against the same `--store` relays nothing
//! the second time.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use runstate::{
    EventBus, EventEnvelope, MemoryStateStore, ParameterSource, RelayConfig, StateChangeProcessor,
    StateStore,
};
use runstate_outbox::MemoryOutbox;
use runstate_persistence::FileStateStore;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "runstate-replay")]
#[command(about = "Replay WorkflowRunStateChange events through the dedup-and-relay core")]
struct Args {
    /// Newline-delimited JSON events. Reads stdin when omitted.
    input: Option<PathBuf>,

    /// Persist records to this JSON-lines file instead of memory.
    #[arg(long)]
    store: Option<PathBuf>,

    /// Configuration file (defaults to ./runstate.toml when present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// File holding the emergency stop list as a JSON array.
    #[arg(long)]
    denylist: Option<PathBuf>,

    /// Events processed per batch.
    #[arg(long, default_value = "10")]
    batch_size: usize,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

// ============================================================================
// Collaborators
// ============================================================================

/// Writes relayed events to stdout, one JSON object per line.
struct StdoutBus;

#[async_trait]
impl EventBus for StdoutBus {
    async fn put_events(&self, events: &[EventEnvelope]) -> Result<()> {
        let mut out = std::io::stdout().lock();
        for event in events {
            serde_json::to_writer(&mut out, event)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }
}

/// Serves every parameter from one local file.
struct FileParameter(PathBuf);

#[async_trait]
impl ParameterSource for FileParameter {
    async fn get_parameter(&self, _name: &str) -> Result<String> {
        std::fs::read_to_string(&self.0)
            .with_context(|| format!("reading denylist file {}", self.0.display()))
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn read_events(input: Option<&PathBuf>) -> Result<Vec<serde_json::Value>> {
    let reader: Box<dyn BufRead> = match input {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let mut events = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(event) => events.push(event),
            Err(err) => warn!(line = index + 1, error = %err, "skipping line that is not JSON"),
        }
    }
    Ok(events)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = match &args.config {
        Some(path) => RelayConfig::load_from(path)?,
        None => RelayConfig::load()?,
    };

    let store: Arc<dyn StateStore> = match &args.store {
        Some(path) => Arc::new(FileStateStore::open(path)?),
        None => Arc::new(MemoryStateStore::new()),
    };
    let parameters = args
        .denylist
        .clone()
        .map(|path| Arc::new(FileParameter(path)) as Arc<dyn ParameterSource>);
    let outbox = MemoryOutbox::new();

    let processor = StateChangeProcessor::from_config(&config, store, Arc::new(StdoutBus), parameters)
        .with_ledger(Arc::new(outbox.clone()));

    let events = read_events(args.input.as_ref())?;
    info!(events = events.len(), namespace = %config.service.namespace, "replaying");

    let mut summary: BTreeMap<&'static str, usize> = BTreeMap::new();
    for batch in events.chunks(args.batch_size.max(1)) {
        for result in processor.process_batch(batch).await {
            let label = match result {
                Ok(outcome) => outcome.label(),
                Err(err) => {
                    warn!(error = %err, "event failed");
                    "failed"
                }
            };
            *summary.entry(label).or_default() += 1;
        }
    }

    let pending = outbox.pending();
    for entry in &pending {
        warn!(
            record_id = %entry.record_id,
            portal_run_id = %entry.portal_run_id,
            failures = entry.failures,
            "record persisted but not relayed"
        );
    }

    info!(?summary, pending = pending.len(), "replay finished");
    Ok(())
}
