//! Relay configuration.
//!
//! Sources, later ones overriding earlier ones:
//! 1. Built-in defaults (the WorkflowManager profile)
//! 2. `runstate.toml` in the working directory, if present
//! 3. Environment variables prefixed `RUNSTATE__`, e.g.
//!    `RUNSTATE__GATE__POLICY=conventional` (a `.env` file is read first)

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::envelope::{RunKind, ServiceProfile};
use crate::gate::RetryPolicy;
use crate::hooks::EMERGENCY_STOP_PARAMETER;
use crate::policy::{TransitionPolicy, RUNNING_UPDATE_WINDOW_SECS};
use crate::relay::{MAX_BATCH, MAX_EVENT_BYTES};

pub const DEFAULT_CONFIG_FILE: &str = "runstate";
pub const ENV_PREFIX: &str = "RUNSTATE";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub service: ServiceConfig,
    pub gate: GateConfig,
    pub timeouts: TimeoutConfig,
    pub relay: RelayTuning,
    pub denylist: DenylistConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub namespace: String,
    pub detail_type: String,
    pub run_kind: RunKind,
    pub accept_detail_type: Option<String>,
    /// Stamped on outbound events. Empty leaves them unaddressed.
    pub event_bus_name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let profile = ServiceProfile::default();
        Self {
            namespace: profile.namespace,
            detail_type: profile.detail_type,
            run_kind: profile.run_kind,
            accept_detail_type: profile.accept_detail_type,
            event_bus_name: "OrcaBusMain".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn profile(&self) -> ServiceProfile {
        ServiceProfile {
            namespace: self.namespace.clone(),
            detail_type: self.detail_type.clone(),
            run_kind: self.run_kind,
            accept_detail_type: self.accept_detail_type.clone(),
            event_bus_name: Some(self.event_bus_name.clone()).filter(|name| !name.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    TimestampMonotonic,
    Conventional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub policy: PolicyKind,
    pub running_update_window_secs: u64,
    pub identity_window_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            policy: PolicyKind::default(),
            running_update_window_secs: RUNNING_UPDATE_WINDOW_SECS as u64,
            identity_window_secs: 300,
            max_attempts: retry.max_attempts,
            backoff_base_ms: retry.base_delay.as_millis() as u64,
            backoff_max_ms: retry.max_delay.as_millis() as u64,
        }
    }
}

impl GateConfig {
    pub fn transition_policy(&self) -> TransitionPolicy {
        match self.policy {
            PolicyKind::TimestampMonotonic => TransitionPolicy::TimestampMonotonic,
            PolicyKind::Conventional => TransitionPolicy::Conventional {
                running_update_window: seconds(self.running_update_window_secs),
            },
        }
    }

    pub fn identity_window(&self) -> chrono::Duration {
        seconds(self.identity_window_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1_000))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub store_ms: u64,
    pub emit_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            store_ms: 5_000,
            emit_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn store(&self) -> Duration {
        Duration::from_millis(self.store_ms)
    }

    pub fn emit(&self) -> Duration {
        Duration::from_millis(self.emit_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayTuning {
    /// Entries per `put_events` call, capped at the bus limit.
    pub max_batch: usize,
    /// Events of one batch processed at the same time.
    pub concurrency: usize,
    pub max_event_bytes: usize,
}

impl Default for RelayTuning {
    fn default() -> Self {
        Self {
            max_batch: MAX_BATCH,
            concurrency: 8,
            max_event_bytes: MAX_EVENT_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenylistConfig {
    pub enabled: bool,
    pub parameter_name: String,
}

impl Default for DenylistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            parameter_name: EMERGENCY_STOP_PARAMETER.to_string(),
        }
    }
}

impl RelayConfig {
    /// Load from `runstate.toml` and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from the given file (extension optional) and the environment.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        // A missing .env is fine.
        let _ = dotenvy::dotenv();

        let path = path.as_ref();
        let settings = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("loading configuration from {}", path.display()))?;

        settings
            .try_deserialize()
            .context("invalid runstate configuration")
    }

    /// Parse a TOML document on top of the defaults.
    pub fn from_toml(toml: &str) -> Result<Self> {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
            .context("invalid runstate configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_the_workflow_manager_profile() {
        let config = RelayConfig::default();
        assert_eq!(
            config.service.profile(),
            ServiceProfile {
                event_bus_name: Some("OrcaBusMain".into()),
                ..ServiceProfile::workflow_manager()
            }
        );
        assert_eq!(config.gate.transition_policy(), TransitionPolicy::TimestampMonotonic);
        assert_eq!(config.relay.max_batch, 10);
        assert!(config.denylist.enabled);
        assert_eq!(config.denylist.parameter_name, "/iap/workflow/emergency_stop_list");
    }

    #[test]
    fn toml_overrides_only_what_it_names() {
        let config = RelayConfig::from_toml(
            r#"
            [service]
            namespace = "orcabus.casemanager"
            detail_type = "CaseRunStateChange"
            run_kind = "case"
            event_bus_name = ""

            [gate]
            policy = "conventional"
            running_update_window_secs = 600
            "#,
        )
        .unwrap();

        assert_eq!(config.service.profile(), ServiceProfile::case_manager());
        assert_eq!(
            config.gate.transition_policy(),
            TransitionPolicy::Conventional {
                running_update_window: chrono::Duration::minutes(10)
            }
        );
        assert_eq!(config.gate.max_attempts, 5);
        assert_eq!(config.timeouts, TimeoutConfig::default());
    }

    #[test]
    fn environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[relay]\nconcurrency = 2\nmax_batch = 5").unwrap();

        std::env::set_var("RUNSTATE__RELAY__CONCURRENCY", "16");
        let config = RelayConfig::load_from(file.path());
        std::env::remove_var("RUNSTATE__RELAY__CONCURRENCY");
        let config = config.unwrap();

        assert_eq!(config.relay.concurrency, 16);
        assert_eq!(config.relay.max_batch, 5);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = RelayConfig::load_from("/nonexistent/runstate-config").unwrap();
        assert_eq!(config.timeouts.store(), Duration::from_secs(5));
    }

    #[test]
    fn retry_policy_never_has_zero_attempts() {
        let gate = GateConfig {
            max_attempts: 0,
            ..GateConfig::default()
        };
        assert_eq!(gate.retry_policy().max_attempts, 1);
    }
}
