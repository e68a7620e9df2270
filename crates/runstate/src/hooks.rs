//! Business-rule hooks evaluated after a record is persisted.
//!
//! A veto suppresses the relay of an accepted record. It never undoes the
//! append: the record stays in the ledger and later redeliveries of the same
//! event are duplicates.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::{Run, StateRecord};

/// Default name of the emergency stop parameter.
pub const EMERGENCY_STOP_PARAMETER: &str = "/iap/workflow/emergency_stop_list";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookVerdict {
    Allow,
    Veto(String),
}

impl HookVerdict {
    pub fn is_veto(&self) -> bool {
        matches!(self, HookVerdict::Veto(_))
    }
}

/// A rule consulted before an accepted record is relayed.
#[async_trait]
pub trait BusinessRule: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn evaluate(&self, run: &Run, record: &StateRecord) -> HookVerdict;
}

/// Rules evaluated in order. The first veto wins.
#[derive(Clone, Default)]
pub struct HookChain {
    rules: Vec<Arc<dyn BusinessRule>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule<R: BusinessRule>(mut self, rule: R) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    pub fn push(&mut self, rule: Arc<dyn BusinessRule>) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub async fn evaluate(&self, run: &Run, record: &StateRecord) -> HookVerdict {
        for rule in &self.rules {
            if let HookVerdict::Veto(reason) = rule.evaluate(run, record).await {
                debug!(rule = rule.name(), reason = %reason, "relay vetoed");
                return HookVerdict::Veto(reason);
            }
        }
        HookVerdict::Allow
    }
}

/// Membership check against an externally managed denylist.
#[async_trait]
pub trait DenylistLookup: Send + Sync + 'static {
    async fn is_denylisted(&self, run_identifier: &str) -> anyhow::Result<bool>;
}

/// Parameter store read access (SSM-style: name in, string value out).
#[async_trait]
pub trait ParameterSource: Send + Sync + 'static {
    async fn get_parameter(&self, name: &str) -> anyhow::Result<String>;
}

/// Denylist stored as a JSON array of identifiers in one parameter.
pub struct ParameterDenylist {
    source: Arc<dyn ParameterSource>,
    parameter_name: String,
}

impl ParameterDenylist {
    pub fn new(source: Arc<dyn ParameterSource>) -> Self {
        Self {
            source,
            parameter_name: EMERGENCY_STOP_PARAMETER.to_string(),
        }
    }

    pub fn with_parameter_name(mut self, name: impl Into<String>) -> Self {
        self.parameter_name = name.into();
        self
    }

    pub fn parameter_name(&self) -> &str {
        &self.parameter_name
    }

    async fn entries(&self) -> anyhow::Result<Vec<String>> {
        let raw = self
            .source
            .get_parameter(&self.parameter_name)
            .await
            .with_context(|| format!("reading parameter {}", self.parameter_name))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parameter {} is not a JSON string array", self.parameter_name))
    }
}

#[async_trait]
impl DenylistLookup for ParameterDenylist {
    async fn is_denylisted(&self, run_identifier: &str) -> anyhow::Result<bool> {
        Ok(self.entries().await?.iter().any(|e| e == run_identifier))
    }
}

/// Vetoes relays for runs on the emergency stop list.
///
/// Lookup failures are logged and treated as "not listed".
pub struct EmergencyStopRule {
    denylist: Arc<dyn DenylistLookup>,
}

impl EmergencyStopRule {
    pub fn new(denylist: Arc<dyn DenylistLookup>) -> Self {
        Self { denylist }
    }

    /// Portal run id, then the instrument run id from the payload if any.
    fn identifiers(record: &StateRecord) -> Vec<&str> {
        let mut ids = vec![record.identity.portal_run_id.as_str()];
        if let Some(instrument_run_id) = record
            .payload
            .as_ref()
            .and_then(|p| p.data.get("instrumentRunId"))
            .and_then(Value::as_str)
        {
            ids.push(instrument_run_id);
        }
        ids
    }
}

#[async_trait]
impl BusinessRule for EmergencyStopRule {
    fn name(&self) -> &'static str {
        "emergency_stop"
    }

    async fn evaluate(&self, _run: &Run, record: &StateRecord) -> HookVerdict {
        for id in Self::identifiers(record) {
            match self.denylist.is_denylisted(id).await {
                Ok(true) => {
                    return HookVerdict::Veto(format!("{id} is on the emergency stop list"));
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        portal_run_id = %record.identity.portal_run_id,
                        run_identifier = id,
                        error = %err,
                        "emergency stop lookup failed, allowing relay"
                    );
                }
            }
        }
        HookVerdict::Allow
    }
}
