//! Event envelope codec.
//!
//! Inbound events arrive wrapped in a bus envelope:
//!
//! ```json
//! {
//!   "source": "orcabus.executionservice",
//!   "detail-type": "WorkflowRunStateChange",
//!   "detail": {
//!     "portalRunId": "202405012397gatc",
//!     "executionId": "icav2.id.12345",
//!     "timestamp": "2025-05-01T09:25:44Z",
//!     "status": "DRAFT",
//!     "workflowName": "ctTSO500",
//!     "workflowVersion": "4.2.7",
//!     "payload": { "version": "0.1.0", "data": { ... } }
//!   }
//! }
//! ```
//!
//! Decoding validates the detail into a typed [`StateChange`]. Encoding
//! produces the canonical outbound event under the service's own namespace.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::{LinkedLibrary, PayloadData, RunIdentity, StateChange, StateRecord, Status};
use crate::error::DecodeError;

pub const WORKFLOW_MANAGER_NAMESPACE: &str = "orcabus.workflowmanager";
pub const CASE_MANAGER_NAMESPACE: &str = "orcabus.casemanager";
pub const WORKFLOW_RUN_STATE_CHANGE: &str = "WorkflowRunStateChange";
pub const CASE_RUN_STATE_CHANGE: &str = "CaseRunStateChange";

/// Generic bus envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    #[serde(rename = "detail-type", alias = "detailType")]
    pub detail_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Target bus for outbound events; absent on inbound ones.
    #[serde(
        default,
        rename = "eventBusName",
        skip_serializing_if = "Option::is_none"
    )]
    pub event_bus_name: Option<String>,
    pub detail: Value,
}

/// Which field names the detail uses for the run's definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// `workflowName` / `workflowVersion` / `workflowRunName`
    Workflow,
    /// `caseName` / `caseVersion` / `caseRunName`
    Case,
}

/// The relaying service's identity on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceProfile {
    /// Outbound `source`.
    pub namespace: String,
    /// Outbound `detail-type`.
    pub detail_type: String,
    pub run_kind: RunKind,
    /// When set, inbound events with another detail type are rejected.
    pub accept_detail_type: Option<String>,
    /// Bus that outbound events are addressed to.
    pub event_bus_name: Option<String>,
}

impl ServiceProfile {
    pub fn workflow_manager() -> Self {
        Self {
            namespace: WORKFLOW_MANAGER_NAMESPACE.to_string(),
            detail_type: WORKFLOW_RUN_STATE_CHANGE.to_string(),
            run_kind: RunKind::Workflow,
            accept_detail_type: None,
            event_bus_name: None,
        }
    }

    pub fn case_manager() -> Self {
        Self {
            namespace: CASE_MANAGER_NAMESPACE.to_string(),
            detail_type: CASE_RUN_STATE_CHANGE.to_string(),
            run_kind: RunKind::Case,
            accept_detail_type: None,
            event_bus_name: None,
        }
    }
}

impl Default for ServiceProfile {
    fn default() -> Self {
        Self::workflow_manager()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStateChange {
    #[serde(default, alias = "caseName")]
    workflow_name: Option<String>,
    #[serde(default, alias = "caseVersion")]
    workflow_version: Option<String>,
    #[serde(default, alias = "caseRunName")]
    workflow_run_name: Option<String>,
    #[serde(default)]
    portal_run_id: Option<String>,
    #[serde(default)]
    execution_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    payload: Option<RawPayload>,
    #[serde(default)]
    linked_libraries: Option<Vec<LinkedLibrary>>,
}

#[derive(Debug, Deserialize)]
struct RawPayload {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, DecodeError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(DecodeError::MissingField(field)),
    }
}

/// Parse an ISO-8601 timestamp.
///
/// Offset-less values are taken as UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, DecodeError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| DecodeError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Pure transform between bus envelopes and state changes.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeCodec {
    profile: ServiceProfile,
}

impl EnvelopeCodec {
    pub fn new(profile: ServiceProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &ServiceProfile {
        &self.profile
    }

    /// Decode a raw bus event.
    pub fn decode(&self, raw: &Value) -> Result<StateChange, DecodeError> {
        let envelope: EventEnvelope = serde_json::from_value(raw.clone())
            .map_err(|e| DecodeError::Envelope(e.to_string()))?;
        self.decode_envelope(&envelope)
    }

    pub fn decode_envelope(&self, envelope: &EventEnvelope) -> Result<StateChange, DecodeError> {
        if let Some(expected) = &self.profile.accept_detail_type {
            if &envelope.detail_type != expected {
                return Err(DecodeError::UnexpectedDetailType {
                    expected: expected.clone(),
                    actual: envelope.detail_type.clone(),
                });
            }
        }
        Self::decode_detail(&envelope.detail)
    }

    /// Decode a bare detail object.
    pub fn decode_detail(detail: &Value) -> Result<StateChange, DecodeError> {
        if !detail.is_object() {
            return Err(DecodeError::Envelope("detail is not an object".to_string()));
        }
        let raw: RawStateChange = serde_json::from_value(detail.clone())?;

        let portal_run_id = required(raw.portal_run_id, "portalRunId")?;
        let status_raw = required(raw.status, "status")?;
        let status = Status::from_convention(&status_raw).ok_or(DecodeError::MissingField("status"))?;
        let timestamp = parse_timestamp(&required(raw.timestamp, "timestamp")?)?;
        let workflow_name = required(raw.workflow_name, "workflowName")?;
        let workflow_version = required(raw.workflow_version, "workflowVersion")?;

        let payload = match raw.payload {
            Some(p) => Some(PayloadData {
                version: required(p.version, "payload.version")?,
                data: p.data.unwrap_or_else(|| Value::Object(Map::new())),
            }),
            None => None,
        };

        Ok(StateChange {
            identity: RunIdentity {
                portal_run_id,
                execution_id: raw.execution_id.filter(|e| !e.trim().is_empty()),
                workflow_name,
                workflow_version,
            },
            status,
            timestamp,
            comment: raw.comment,
            payload,
            workflow_run_name: raw.workflow_run_name,
            linked_libraries: raw.linked_libraries.unwrap_or_default(),
        })
    }

    /// Canonical outbound event for an accepted record.
    pub fn encode(&self, record: &StateRecord) -> Result<EventEnvelope, serde_json::Error> {
        Ok(EventEnvelope {
            id: Some(Uuid::new_v4().to_string()),
            source: self.profile.namespace.clone(),
            detail_type: self.profile.detail_type.clone(),
            time: Some(Utc::now()),
            event_bus_name: self.profile.event_bus_name.clone(),
            detail: self.encode_detail(record)?,
        })
    }

    pub fn encode_detail(&self, record: &StateRecord) -> Result<Value, serde_json::Error> {
        let (name_key, version_key, run_name_key) = match self.profile.run_kind {
            RunKind::Workflow => ("workflowName", "workflowVersion", "workflowRunName"),
            RunKind::Case => ("caseName", "caseVersion", "caseRunName"),
        };

        let mut detail = Map::new();
        detail.insert(
            "portalRunId".into(),
            Value::String(record.identity.portal_run_id.clone()),
        );
        if let Some(execution_id) = &record.identity.execution_id {
            detail.insert("executionId".into(), Value::String(execution_id.clone()));
        }
        detail.insert(
            "timestamp".into(),
            Value::String(format_timestamp(&record.timestamp)),
        );
        detail.insert("status".into(), Value::String(record.status.to_string()));
        detail.insert(
            name_key.into(),
            Value::String(record.identity.workflow_name.clone()),
        );
        detail.insert(
            version_key.into(),
            Value::String(record.identity.workflow_version.clone()),
        );
        if let Some(run_name) = &record.workflow_run_name {
            detail.insert(run_name_key.into(), Value::String(run_name.clone()));
        }
        if !record.linked_libraries.is_empty() {
            detail.insert(
                "linkedLibraries".into(),
                serde_json::to_value(&record.linked_libraries)?,
            );
        }
        if let Some(payload) = &record.payload {
            let mut p = Map::new();
            p.insert(
                "refId".into(),
                Value::String(payload.payload_ref_id.to_string()),
            );
            p.insert("version".into(), Value::String(payload.version.clone()));
            p.insert("data".into(), payload.data.clone());
            detail.insert("payload".into(), Value::Object(p));
        }
        Ok(Value::Object(detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NewStateRecord;
    use serde_json::json;

    fn inbound() -> Value {
        json!({
            "version": "0",
            "id": "6a7e8feb-b491-4cf7-a9f1-bf3703467718",
            "source": "orcabus.executionservice",
            "detail-type": "WorkflowRunStateChange",
            "account": "123456789012",
            "region": "ap-southeast-2",
            "resources": [],
            "detail": {
                "portalRunId": "202405012397gatc",
                "executionId": "icav2.id.12345",
                "timestamp": "2025-05-01T09:25:44Z",
                "status": "draft",
                "workflowName": "ctTSO500",
                "workflowVersion": "4.2.7",
                "workflowRunName": "ctTSO500-L000002",
                "linkedLibraries": [
                    { "libraryId": "L000001", "orcabusId": "lib.01J5M2J44HFJ9424G7074NKTGN" }
                ],
                "payload": {
                    "version": "0.1.0",
                    "data": { "projectId": "bxxxxxxxx", "instrumentRunId": "240424_A01052_0193_BH5LYWDSXY" }
                }
            }
        })
    }

    #[test]
    fn decodes_a_full_execution_service_event() {
        let change = EnvelopeCodec::default().decode(&inbound()).unwrap();
        assert_eq!(change.identity.portal_run_id, "202405012397gatc");
        assert_eq!(change.identity.execution_id.as_deref(), Some("icav2.id.12345"));
        assert_eq!(change.status, Status::Draft);
        assert_eq!(format_timestamp(&change.timestamp), "2025-05-01T09:25:44Z");
        assert_eq!(change.workflow_run_name.as_deref(), Some("ctTSO500-L000002"));
        assert_eq!(change.linked_libraries.len(), 1);
        assert_eq!(change.payload.unwrap().version, "0.1.0");
    }

    #[test]
    fn camel_case_detail_type_is_accepted() {
        let mut raw = inbound();
        let obj = raw.as_object_mut().unwrap();
        let dt = obj.remove("detail-type").unwrap();
        obj.insert("detailType".into(), dt);
        assert!(EnvelopeCodec::default().decode(&raw).is_ok());
    }

    #[test]
    fn missing_required_fields_fail_fast() {
        for field in ["portalRunId", "status", "timestamp", "workflowName"] {
            let mut raw = inbound();
            raw["detail"].as_object_mut().unwrap().remove(field);
            let err = EnvelopeCodec::default().decode(&raw).unwrap_err();
            assert!(
                matches!(err, DecodeError::MissingField(f) if f == field),
                "{field}: {err}"
            );
        }
    }

    #[test]
    fn blank_status_is_missing() {
        let mut raw = inbound();
        raw["detail"]["status"] = json!("  ");
        assert!(matches!(
            EnvelopeCodec::default().decode(&raw),
            Err(DecodeError::MissingField("status"))
        ));
    }

    #[test]
    fn malformed_timestamp_is_rejected() {
        let mut raw = inbound();
        raw["detail"]["timestamp"] = json!("yesterday at noon");
        assert!(matches!(
            EnvelopeCodec::default().decode(&raw),
            Err(DecodeError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn naive_timestamps_are_utc() {
        let ts = parse_timestamp("2024-01-03T23:55:59.342380").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-01-03T23:55:59.342380Z");
        let offset = parse_timestamp("2024-01-04T09:55:59+10:00").unwrap();
        assert_eq!(format_timestamp(&offset), "2024-01-03T23:55:59Z");
    }

    #[test]
    fn unknown_status_passes_through() {
        let mut raw = inbound();
        raw["detail"]["status"] = json!("Queued");
        let change = EnvelopeCodec::default().decode(&raw).unwrap();
        assert_eq!(change.status, Status::Other("QUEUED".into()));
    }

    #[test]
    fn non_object_detail_is_an_envelope_error() {
        let raw = json!({ "source": "x", "detail-type": "y", "detail": "nope" });
        assert!(matches!(
            EnvelopeCodec::default().decode(&raw),
            Err(DecodeError::Envelope(_))
        ));
        let raw = json!({ "detail": {} });
        assert!(matches!(
            EnvelopeCodec::default().decode(&raw),
            Err(DecodeError::Envelope(_))
        ));
    }

    #[test]
    fn unexpected_detail_type_is_rejected_when_configured() {
        let profile = ServiceProfile {
            accept_detail_type: Some("WorkflowRunStateChange".into()),
            ..ServiceProfile::workflow_manager()
        };
        let mut raw = inbound();
        raw["detail-type"] = json!("SequenceRunStateChange");
        assert!(matches!(
            EnvelopeCodec::new(profile).decode(&raw),
            Err(DecodeError::UnexpectedDetailType { .. })
        ));
    }

    #[test]
    fn encode_resources_under_own_namespace_with_payload_ref() {
        let codec = EnvelopeCodec::default();
        let change = codec.decode(&inbound()).unwrap();
        let record = NewStateRecord::from(change).into_record(1, Utc::now());
        let out = codec.encode(&record).unwrap();

        assert_eq!(out.source, WORKFLOW_MANAGER_NAMESPACE);
        assert_eq!(out.detail_type, WORKFLOW_RUN_STATE_CHANGE);
        assert_eq!(out.detail["status"], "DRAFT");
        assert_eq!(out.detail["timestamp"], "2025-05-01T09:25:44Z");
        assert_eq!(out.detail["workflowRunName"], "ctTSO500-L000002");
        let ref_id = record.payload.as_ref().unwrap().payload_ref_id.to_string();
        assert_eq!(out.detail["payload"]["refId"], Value::String(ref_id));
        assert_eq!(
            out.detail["linkedLibraries"],
            json!([{ "libraryId": "L000001", "orcabusId": "lib.01J5M2J44HFJ9424G7074NKTGN" }])
        );

        let wire = serde_json::to_value(&out).unwrap();
        assert_eq!(wire["detail-type"], WORKFLOW_RUN_STATE_CHANGE);
        assert!(wire.get("eventBusName").is_none());
    }

    #[test]
    fn outbound_events_carry_the_configured_bus_name() {
        let codec = EnvelopeCodec::new(ServiceProfile {
            event_bus_name: Some("OrcaBusMain".into()),
            ..ServiceProfile::workflow_manager()
        });
        let change = codec.decode(&inbound()).unwrap();

        let record = NewStateRecord::from(change).into_record(1, Utc::now());
        let out = codec.encode(&record).unwrap();
        assert_eq!(out.event_bus_name.as_deref(), Some("OrcaBusMain"));
        assert_eq!(serde_json::to_value(&out).unwrap()["eventBusName"], "OrcaBusMain");
    }

    #[test]
    fn case_profile_uses_case_field_names_both_ways() {
        let codec = EnvelopeCodec::new(ServiceProfile::case_manager());
        let raw = json!({
            "source": "orcabus.executionservice",
            "detail-type": "CaseRunStateChange",
            "detail": {
                "portalRunId": "20240601deadbeef",
                "timestamp": "2024-06-01T00:00:00Z",
                "status": "RESOLVED",
                "caseName": "TestCase",
                "caseVersion": "1.0",
                "caseRunName": "TestCase-001"
            }
        });
        let change = codec.decode(&raw).unwrap();
        assert_eq!(change.identity.workflow_name, "TestCase");

        let record = NewStateRecord::from(change).into_record(1, Utc::now());
        let detail = codec.encode_detail(&record).unwrap();
        assert_eq!(detail["caseName"], "TestCase");
        assert_eq!(detail["caseRunName"], "TestCase-001");
        assert!(detail.get("workflowName").is_none());
        assert!(detail.get("payload").is_none());
    }
}
