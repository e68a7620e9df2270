//! PostgreSQL implementation of the runstate state store.
//!
//! This crate provides a production-ready PostgreSQL implementation of the
//! `StateStore` trait from runstate.
//!
//! # Features
//!
//! - Conditional append on the per-run ledger version, enforced by a unique
//!   `(portal_run_id, seq)` constraint
//! - Payloads stored once per record, referenced by `payload_ref_id`
//! - Window queries served by an index on `(portal_run_id, observed_at)`
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE state_payloads (
//!     payload_ref_id UUID PRIMARY KEY,
//!     version TEXT NOT NULL,
//!     data JSONB NOT NULL
//! );
//!
//! CREATE TABLE state_records (
//!     id UUID PRIMARY KEY,
//!     portal_run_id TEXT NOT NULL,
//!     seq BIGINT NOT NULL,
//!
//!     -- Identity
//!     execution_id TEXT,
//!     workflow_name TEXT NOT NULL,
//!     workflow_version TEXT NOT NULL,
//!     workflow_run_name TEXT,
//!
//!     -- Observation
//!     status TEXT NOT NULL,
//!     observed_at TIMESTAMPTZ NOT NULL,
//!     comment TEXT,
//!     payload_ref_id UUID REFERENCES state_payloads (payload_ref_id),
//!     linked_libraries JSONB NOT NULL DEFAULT '[]',
//!
//!     recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     UNIQUE (portal_run_id, seq)
//! );
//!
//! CREATE INDEX idx_state_records_run_time ON state_records (portal_run_id, observed_at);
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use runstate_postgres::PgStateStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let store = PgStateStore::new(pool);
//! store.ensure_schema().await?;
//!
//! let gate = TransitionGate::new(Arc::new(store));
//! ```

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use runstate::{
    LedgerSnapshot, LinkedLibrary, NewStateRecord, Payload, RunIdentity, StateRecord, StateStore,
    Status, StorageError,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS state_payloads (
        payload_ref_id UUID PRIMARY KEY,
        version TEXT NOT NULL,
        data JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS state_records (
        id UUID PRIMARY KEY,
        portal_run_id TEXT NOT NULL,
        seq BIGINT NOT NULL,
        execution_id TEXT,
        workflow_name TEXT NOT NULL,
        workflow_version TEXT NOT NULL,
        workflow_run_name TEXT,
        status TEXT NOT NULL,
        observed_at TIMESTAMPTZ NOT NULL,
        comment TEXT,
        payload_ref_id UUID REFERENCES state_payloads (payload_ref_id),
        linked_libraries JSONB NOT NULL DEFAULT '[]',
        recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (portal_run_id, seq)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_state_records_run_time
        ON state_records (portal_run_id, observed_at)
    "#,
];

const SELECT_RECORDS: &str = r#"
    SELECT r.id, r.seq, r.portal_run_id, r.execution_id, r.workflow_name,
           r.workflow_version, r.workflow_run_name, r.status, r.observed_at,
           r.comment, r.payload_ref_id, r.linked_libraries, r.recorded_at,
           p.version AS payload_version, p.data AS payload_data
    FROM state_records r
    LEFT JOIN state_payloads p ON p.payload_ref_id = r.payload_ref_id
"#;

/// PostgreSQL state store implementation.
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("creating state store schema")?;
        }
        Ok(())
    }

    /// Number of runs with at least one record.
    pub async fn run_count(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(DISTINCT portal_run_id) AS runs FROM state_records")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, None))?;
        let runs: i64 = row.get("runs");
        Ok(runs.max(0) as u64)
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn snapshot(&self, portal_run_id: &str) -> Result<LedgerSnapshot, StorageError> {
        let query = format!("{SELECT_RECORDS} WHERE r.portal_run_id = $1 ORDER BY r.observed_at, r.seq");
        let rows = sqlx::query(&query)
            .bind(portal_run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, None))?;

        let records = rows.iter().map(record_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(LedgerSnapshot::from_records(portal_run_id, records))
    }

    /// Append inside one transaction.
    ///
    /// The version check catches most races early; the unique constraint on
    /// `(portal_run_id, seq)` catches the rest.
    async fn append(
        &self,
        record: NewStateRecord,
        expected_version: u64,
    ) -> Result<StateRecord, StorageError> {
        let portal_run_id = record.identity.portal_run_id.clone();
        let conflict = || StorageError::Conflict {
            portal_run_id: portal_run_id.clone(),
            expected_version,
        };
        let map = |e: sqlx::Error| map_sqlx_error(e, Some((&portal_run_id, expected_version)));

        let mut tx = self.pool.begin().await.map_err(map)?;

        let row = sqlx::query(
            "SELECT COALESCE(MAX(seq), 0) AS version FROM state_records WHERE portal_run_id = $1",
        )
        .bind(&portal_run_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map)?;
        let version: i64 = row.get("version");
        if version as u64 != expected_version {
            debug!(
                portal_run_id = %portal_run_id,
                version,
                expected_version,
                "ledger moved before append"
            );
            return Err(conflict());
        }

        let seq = expected_version + 1;
        let stored = record.into_record(seq, Utc::now());

        if let Some(payload) = &stored.payload {
            sqlx::query(
                "INSERT INTO state_payloads (payload_ref_id, version, data) VALUES ($1, $2, $3)",
            )
            .bind(payload.payload_ref_id)
            .bind(&payload.version)
            .bind(&payload.data)
            .execute(&mut *tx)
            .await
            .map_err(map)?;
        }

        let linked_libraries = serde_json::to_value(&stored.linked_libraries)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO state_records (
                id, portal_run_id, seq, execution_id, workflow_name, workflow_version,
                workflow_run_name, status, observed_at, comment, payload_ref_id,
                linked_libraries, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(stored.id)
        .bind(&stored.identity.portal_run_id)
        .bind(seq as i64)
        .bind(&stored.identity.execution_id)
        .bind(&stored.identity.workflow_name)
        .bind(&stored.identity.workflow_version)
        .bind(&stored.workflow_run_name)
        .bind(stored.status.as_str())
        .bind(stored.timestamp)
        .bind(&stored.comment)
        .bind(stored.payload.as_ref().map(|p| p.payload_ref_id))
        .bind(linked_libraries)
        .bind(stored.recorded_at)
        .execute(&mut *tx)
        .await
        .map_err(map)?;

        tx.commit().await.map_err(map)?;
        Ok(stored)
    }

    async fn find_by_portal_run_id_status_and_time_window(
        &self,
        portal_run_id: &str,
        status: Option<&Status>,
        timestamp: Option<DateTime<Utc>>,
        window: Duration,
    ) -> Result<Vec<StateRecord>, StorageError> {
        let query = format!(
            r#"{SELECT_RECORDS}
            WHERE r.portal_run_id = $1
              AND ($2::TEXT IS NULL OR r.status = $2)
              AND ($3::TIMESTAMPTZ IS NULL
                   OR r.observed_at BETWEEN $3 - make_interval(secs => $4)
                                        AND $3 + make_interval(secs => $4))
            ORDER BY r.observed_at, r.seq"#
        );
        let rows = sqlx::query(&query)
            .bind(portal_run_id)
            .bind(status.map(Status::as_str))
            .bind(timestamp)
            .bind(window.num_milliseconds().abs() as f64 / 1_000.0)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, None))?;

        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &PgRow) -> Result<StateRecord, StorageError> {
    let corrupt = |e: sqlx::Error| StorageError::Corrupt(e.to_string());

    let raw_status: String = row.try_get("status").map_err(corrupt)?;
    let status = Status::from_convention(&raw_status)
        .ok_or_else(|| StorageError::Corrupt("blank status".to_string()))?;

    let payload = match row.try_get::<Option<Uuid>, _>("payload_ref_id").map_err(corrupt)? {
        Some(payload_ref_id) => Some(Payload {
            payload_ref_id,
            version: row.try_get("payload_version").map_err(corrupt)?,
            data: row.try_get("payload_data").map_err(corrupt)?,
        }),
        None => None,
    };

    let linked_libraries: serde_json::Value = row.try_get("linked_libraries").map_err(corrupt)?;
    let linked_libraries: Vec<LinkedLibrary> = serde_json::from_value(linked_libraries)
        .map_err(|e| StorageError::Corrupt(e.to_string()))?;

    let seq: i64 = row.try_get("seq").map_err(corrupt)?;

    Ok(StateRecord {
        id: row.try_get("id").map_err(corrupt)?,
        seq: seq.max(0) as u64,
        identity: RunIdentity {
            portal_run_id: row.try_get("portal_run_id").map_err(corrupt)?,
            execution_id: row.try_get("execution_id").map_err(corrupt)?,
            workflow_name: row.try_get("workflow_name").map_err(corrupt)?,
            workflow_version: row.try_get("workflow_version").map_err(corrupt)?,
        },
        status,
        timestamp: row.try_get("observed_at").map_err(corrupt)?,
        comment: row.try_get("comment").map_err(corrupt)?,
        payload,
        workflow_run_name: row.try_get("workflow_run_name").map_err(corrupt)?,
        linked_libraries,
        recorded_at: row.try_get("recorded_at").map_err(corrupt)?,
    })
}

/// Translate a driver error. `append` passes the run and version it expected
/// so that a lost insert race surfaces as a conflict.
fn map_sqlx_error(err: sqlx::Error, append: Option<(&str, u64)>) -> StorageError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            match (code.as_str(), append) {
                ("23505", Some((portal_run_id, expected_version))) => StorageError::Conflict {
                    portal_run_id: portal_run_id.to_string(),
                    expected_version,
                },
                // serialization_failure, deadlock_detected
                ("40001" | "40P01", Some((portal_run_id, expected_version))) => {
                    StorageError::Conflict {
                        portal_run_id: portal_run_id.to_string(),
                        expected_version,
                    }
                }
                (c, _) if c.starts_with("23") => StorageError::Constraint(db.message().to_string()),
                _ => StorageError::Unavailable(err.to_string()),
            }
        }
        sqlx::Error::RowNotFound
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_) => StorageError::Corrupt(err.to_string()),
        _ => StorageError::Unavailable(err.to_string()),
    }
}
