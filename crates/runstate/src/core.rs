//! Core data model: run identities, statuses, state records and ledgers.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Immutable key of one workflow or case execution attempt.
///
/// `portal_run_id` is the stable join key across services. The execution id
/// is engine-assigned and is frequently absent on the first (DRAFT) report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunIdentity {
    pub portal_run_id: String,
    pub execution_id: Option<String>,
    pub workflow_name: String,
    pub workflow_version: String,
}

impl RunIdentity {
    pub fn new(
        portal_run_id: impl Into<String>,
        workflow_name: impl Into<String>,
        workflow_version: impl Into<String>,
    ) -> Self {
        Self {
            portal_run_id: portal_run_id.into(),
            execution_id: None,
            workflow_name: workflow_name.into(),
            workflow_version: workflow_version.into(),
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    /// Identity match used by the gate.
    ///
    /// Execution ids only discriminate when both sides carry one.
    pub fn matches(&self, other: &RunIdentity) -> bool {
        self.portal_run_id == other.portal_run_id
            && self.workflow_name == other.workflow_name
            && self.workflow_version == other.workflow_version
            && match (&self.execution_id, &other.execution_id) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{})",
            self.portal_run_id, self.workflow_name, self.workflow_version
        )
    }
}

/// Run status, following the upper-case status conventions.
///
/// Statuses outside the known set are carried as [`Status::Other`] so that
/// newer engines are not rejected at the codec boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    Draft,
    Ready,
    Running,
    Succeeded,
    Failed,
    Aborted,
    Resolved,
    Other(String),
}

impl Status {
    /// Apply status conventions to a reported value.
    ///
    /// Returns `None` for a blank value.
    pub fn from_convention(raw: &str) -> Option<Status> {
        let normalized = raw.trim().to_ascii_uppercase();
        let status = match normalized.as_str() {
            "" => return None,
            "DRAFT" => Status::Draft,
            "READY" => Status::Ready,
            "RUNNING" => Status::Running,
            "SUCCEEDED" | "SUCCESS" | "COMPLETE" | "COMPLETED" => Status::Succeeded,
            "FAILED" | "FAIL" | "FAILURE" => Status::Failed,
            "ABORTED" | "ABORT" | "CANCELLED" | "CANCELED" => Status::Aborted,
            "RESOLVED" => Status::Resolved,
            _ => Status::Other(normalized),
        };
        Some(status)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Status::Draft => "DRAFT",
            Status::Ready => "READY",
            Status::Running => "RUNNING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Aborted => "ABORTED",
            Status::Resolved => "RESOLVED",
            Status::Other(s) => s,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::Failed | Status::Aborted | Status::Resolved
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Status::from_convention(&raw).ok_or_else(|| serde::de::Error::custom("blank status"))
    }
}

/// Payload as reported by the execution engine, before acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadData {
    pub version: String,
    pub data: serde_json::Value,
}

/// Versioned opaque payload owned by exactly one [`StateRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub payload_ref_id: Uuid,
    pub version: String,
    pub data: serde_json::Value,
}

impl Payload {
    /// Assign a fresh reference id to reported payload data.
    pub fn from_data(data: PayloadData) -> Self {
        Self {
            payload_ref_id: Uuid::new_v4(),
            version: data.version,
            data: data.data,
        }
    }
}

/// Library linked to a run, passed through to relayed events untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedLibrary {
    pub library_id: String,
    pub orcabus_id: String,
}

/// A decoded, validated state change candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub identity: RunIdentity,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
    pub comment: Option<String>,
    pub payload: Option<PayloadData>,
    pub workflow_run_name: Option<String>,
    pub linked_libraries: Vec<LinkedLibrary>,
}

impl StateChange {
    pub fn new(identity: RunIdentity, status: Status, timestamp: DateTime<Utc>) -> Self {
        Self {
            identity,
            status,
            timestamp,
            comment: None,
            payload: None,
            workflow_run_name: None,
            linked_libraries: Vec::new(),
        }
    }

    pub fn with_payload(mut self, version: impl Into<String>, data: serde_json::Value) -> Self {
        self.payload = Some(PayloadData {
            version: version.into(),
            data,
        });
        self
    }

    pub fn portal_run_id(&self) -> &str {
        &self.identity.portal_run_id
    }
}

/// A record the gate has decided to append. The store assigns `seq`.
///
/// `id` is fixed when the candidate is built, so every retry of one append
/// writes the same id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStateRecord {
    pub id: Uuid,
    pub identity: RunIdentity,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
    pub comment: Option<String>,
    pub payload: Option<Payload>,
    pub workflow_run_name: Option<String>,
    pub linked_libraries: Vec<LinkedLibrary>,
}

impl From<StateChange> for NewStateRecord {
    fn from(change: StateChange) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: change.identity,
            status: change.status,
            timestamp: change.timestamp,
            comment: change.comment,
            payload: change.payload.map(Payload::from_data),
            workflow_run_name: change.workflow_run_name,
            linked_libraries: change.linked_libraries,
        }
    }
}

impl NewStateRecord {
    /// Materialize the record with store-assigned fields.
    pub fn into_record(self, seq: u64, recorded_at: DateTime<Utc>) -> StateRecord {
        StateRecord {
            id: self.id,
            seq,
            identity: self.identity,
            status: self.status,
            timestamp: self.timestamp,
            comment: self.comment,
            payload: self.payload,
            workflow_run_name: self.workflow_run_name,
            linked_libraries: self.linked_libraries,
            recorded_at,
        }
    }
}

/// One immutable observation of a run's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub id: Uuid,
    /// Insertion order within the portal run ledger, starting at 1.
    pub seq: u64,
    pub identity: RunIdentity,
    pub status: Status,
    /// Origin-supplied time of the observation.
    pub timestamp: DateTime<Utc>,
    pub comment: Option<String>,
    pub payload: Option<Payload>,
    pub workflow_run_name: Option<String>,
    #[serde(default)]
    pub linked_libraries: Vec<LinkedLibrary>,
    /// Server time of the append. Informational only.
    pub recorded_at: DateTime<Utc>,
}

impl StateRecord {
    /// Same status reported at the same instant.
    pub fn is_same_observation(&self, status: &Status, timestamp: DateTime<Utc>) -> bool {
        self.status == *status && self.timestamp == timestamp
    }
}

/// Order records by origin timestamp, ties broken by insertion order.
pub fn sort_records(records: &mut [StateRecord]) {
    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
}

/// The logical run: all records of one identity ordered by timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    identity: RunIdentity,
    records: Vec<StateRecord>,
}

impl Run {
    pub fn new(identity: RunIdentity, mut records: Vec<StateRecord>) -> Self {
        sort_records(&mut records);
        Self { identity, records }
    }

    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    /// The record with the latest timestamp; the last inserted one on ties.
    pub fn current(&self) -> Option<&StateRecord> {
        self.records.last()
    }

    pub fn current_status(&self) -> Option<&Status> {
        self.current().map(|r| &r.status)
    }

    pub fn history(&self) -> &[StateRecord] {
        &self.records
    }

    pub fn contains_status(&self, status: &Status) -> bool {
        self.records.iter().any(|r| r.status == *status)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Atomic read of everything stored under one portal run id.
///
/// `version` is the highest `seq` in the ledger (0 when empty) and is the
/// token for a conditional append.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSnapshot {
    pub portal_run_id: String,
    pub version: u64,
    pub records: Vec<StateRecord>,
}

impl LedgerSnapshot {
    pub fn empty(portal_run_id: impl Into<String>) -> Self {
        Self {
            portal_run_id: portal_run_id.into(),
            version: 0,
            records: Vec::new(),
        }
    }

    /// Build a snapshot from unordered records.
    pub fn from_records(portal_run_id: impl Into<String>, mut records: Vec<StateRecord>) -> Self {
        let version = records.iter().map(|r| r.seq).max().unwrap_or(0);
        sort_records(&mut records);
        Self {
            portal_run_id: portal_run_id.into(),
            version,
            records,
        }
    }

    /// Records whose identity matches, in timestamp order.
    pub fn matching(&self, identity: &RunIdentity) -> Vec<StateRecord> {
        self.records
            .iter()
            .filter(|r| r.identity.matches(identity))
            .cloned()
            .collect()
    }

    /// Records within `window` of `timestamp`, optionally of one status.
    pub fn within_window(
        &self,
        status: Option<&Status>,
        timestamp: Option<DateTime<Utc>>,
        window: Duration,
    ) -> Vec<StateRecord> {
        self.records
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == *s))
            .filter(|r| timestamp.map_or(true, |t| (r.timestamp - t).abs() <= window))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, hour, 0, 0).unwrap()
    }

    fn record(seq: u64, status: Status, ts: DateTime<Utc>) -> StateRecord {
        NewStateRecord::from(StateChange::new(
            RunIdentity::new("PR1", "ctTSO500", "4.2.7"),
            status,
            ts,
        ))
        .into_record(seq, Utc::now())
    }

    #[test]
    fn status_conventions_normalize_case_and_aliases() {
        assert_eq!(Status::from_convention(" draft "), Some(Status::Draft));
        assert_eq!(Status::from_convention("Complete"), Some(Status::Succeeded));
        assert_eq!(Status::from_convention("failure"), Some(Status::Failed));
        assert_eq!(Status::from_convention("cancelled"), Some(Status::Aborted));
        assert_eq!(
            Status::from_convention("queued"),
            Some(Status::Other("QUEUED".into()))
        );
        assert_eq!(Status::from_convention("   "), None);
    }

    #[test]
    fn execution_id_only_discriminates_when_both_present() {
        let base = RunIdentity::new("PR1", "wgs", "1.0");
        let with_exec = base.clone().with_execution_id("icav2.1");
        let other_exec = base.clone().with_execution_id("icav2.2");

        assert!(base.matches(&with_exec));
        assert!(with_exec.matches(&base));
        assert!(!with_exec.matches(&other_exec));
        assert!(!base.matches(&RunIdentity::new("PR1", "wgs", "2.0")));
    }

    #[test]
    fn current_state_is_latest_timestamp_not_latest_insert() {
        let run = Run::new(
            RunIdentity::new("PR1", "ctTSO500", "4.2.7"),
            vec![
                record(1, Status::Draft, at(3)),
                record(2, Status::Draft, at(1)),
                record(3, Status::Running, at(4)),
                record(4, Status::Ready, at(2)),
            ],
        );
        assert_eq!(run.current_status(), Some(&Status::Running));
        let order: Vec<u64> = run.history().iter().map(|r| r.seq).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn equal_timestamps_break_ties_by_insertion() {
        let run = Run::new(
            RunIdentity::new("PR1", "ctTSO500", "4.2.7"),
            vec![
                record(2, Status::Failed, at(5)),
                record(1, Status::Succeeded, at(5)),
            ],
        );
        assert_eq!(run.current_status(), Some(&Status::Failed));
    }

    #[test]
    fn snapshot_version_is_highest_seq() {
        let snap = LedgerSnapshot::from_records(
            "PR1",
            vec![record(2, Status::Ready, at(2)), record(1, Status::Draft, at(1))],
        );
        assert_eq!(snap.version, 2);
        assert_eq!(snap.records[0].seq, 1);
        assert_eq!(LedgerSnapshot::empty("PR2").version, 0);
    }

    #[test]
    fn window_filter_is_symmetric() {
        let snap = LedgerSnapshot::from_records(
            "PR1",
            vec![
                record(1, Status::Draft, at(1)),
                record(2, Status::Ready, at(3)),
                record(3, Status::Running, at(6)),
            ],
        );
        let hits = snap.within_window(None, Some(at(2)), Duration::hours(1));
        assert_eq!(hits.len(), 2);
        let ready = snap.within_window(Some(&Status::Ready), None, Duration::zero());
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn status_serializes_as_convention_string() {
        let json = serde_json::to_string(&Status::Succeeded).unwrap();
        assert_eq!(json, "\"SUCCEEDED\"");
        let parsed: Status = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(parsed, Status::Running);
        assert!(serde_json::from_str::<Status>("\"\"").is_err());
    }
}
