//! The jobs registry: reservation, error, and ignore bookkeeping.
//!
//! One table per schema, keyed by `(target_table_name, key_hash)`, arbitrates
//! which worker owns which key. There is no broker and no heartbeat: the
//! primary-key constraint is the entire coordination protocol. An insert
//! that lands wins the key; an insert rejected as a duplicate IS the
//! reservation-lost signal and is returned as `false`, never raised.
//!
//! Record lifecycle:
//! - inserted with status `reserved` when a worker takes a key
//! - deleted on success (`complete`, idempotent)
//! - replaced with status `error` on failure, carrying the truncated
//!   message and full stack
//! - inserted with status `ignore` to deliberately skip a key
//!
//! Any surviving record - whatever its status - blocks re-reservation until
//! removed. The registry is a system table: maintenance deletes on it take
//! no interactive confirmation.

use std::collections::HashSet;
use std::fmt;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::backend::{Backend, InsertMode};
use crate::error::{BackendError, PopulateError};
use crate::expr::{Expression, Restriction, Row, TableRef};
use crate::key::Key;

/// Name of the per-schema jobs table. The sigil prefix keeps it apart from
/// user tables when the schema is co-located with other services.
pub const JOBS_TABLE: &str = "~jobs";

/// Composite primary key of the jobs table.
pub const JOBS_PRIMARY_KEY: [&str; 2] = ["target_table_name", "key_hash"];

/// Capacity of the `error_message` column.
pub const ERROR_MESSAGE_LIMIT: usize = 2047;

/// Suffix appended to truncated error messages so readers can detect the
/// truncation and go look at `error_stack` for the full text.
pub const TRUNCATION_SUFFIX: &str = "...<truncated>";

/// Status of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// A worker holds the key.
    Reserved,
    /// A previous attempt failed; the record carries the error.
    Error,
    /// The key is deliberately skipped.
    Ignore,
}

impl JobStatus {
    /// The database string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Reserved => "reserved",
            JobStatus::Error => "error",
            JobStatus::Ignore => "ignore",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations on the jobs table.
///
/// All operations run in autocommit - reservations and bookkeeping sit
/// outside the make transaction by construction, so a rolled-back make
/// never takes its error record down with it.
pub struct JobsRegistry;

impl JobsRegistry {
    /// The jobs table as a relational expression source.
    pub fn table_ref() -> TableRef {
        TableRef::new(
            JOBS_TABLE,
            &[
                "target_table_name",
                "key_hash",
                "status",
                "key",
                "error_message",
                "error_stack",
                "user",
                "host",
                "pid",
                "connection_id",
                "timestamp",
            ],
        )
    }

    /// Try to reserve a key for this connection.
    ///
    /// Returns `true` when the reservation landed, `false` when the
    /// uniqueness constraint rejected it (another worker holds the key, or
    /// an error/ignore record blocks it). Any other failure is a registry
    /// error and propagates.
    pub async fn reserve(
        db: &dyn Backend,
        target_name: &str,
        key: &Key,
    ) -> Result<bool, PopulateError> {
        let identity = db.identity().await.map_err(PopulateError::Registry)?;
        let mut row = base_record(target_name, key, JobStatus::Reserved);
        row.insert("user".into(), Value::String(identity.user));
        row.insert("host".into(), Value::String(identity.host));
        row.insert("pid".into(), Value::from(identity.pid));
        row.insert("connection_id".into(), Value::from(identity.connection_id));
        match db.insert(JOBS_TABLE, &[row], InsertMode::Strict).await {
            Ok(()) => {
                debug!(table = %target_name, key = %key, "reserved job");
                Ok(true)
            }
            Err(BackendError::Duplicate { .. }) => Ok(false),
            Err(e) => Err(PopulateError::Registry(e)),
        }
    }

    /// Remove the record for a key. Idempotent: removing a record that does
    /// not exist is a no-op.
    pub async fn complete(
        db: &dyn Backend,
        target_name: &str,
        key: &Key,
    ) -> Result<(), PopulateError> {
        db.delete(JOBS_TABLE, &record_restriction(target_name, key))
            .await
            .map(|_| ())
            .map_err(PopulateError::Registry)
    }

    /// Replace the record for a key with an error record.
    ///
    /// Oversize messages are truncated to the column capacity with
    /// [`TRUNCATION_SUFFIX`] appended; the full text belongs in `stack`.
    pub async fn error(
        db: &dyn Backend,
        target_name: &str,
        key: &Key,
        message: &str,
        stack: &str,
    ) -> Result<(), PopulateError> {
        let mut row = base_record(target_name, key, JobStatus::Error);
        let identity = db.identity().await.map_err(PopulateError::Registry)?;
        row.insert("user".into(), Value::String(identity.user));
        row.insert("host".into(), Value::String(identity.host));
        row.insert("pid".into(), Value::from(identity.pid));
        row.insert("connection_id".into(), Value::from(identity.connection_id));
        row.insert(
            "error_message".into(),
            Value::String(truncate_message(message)),
        );
        row.insert("error_stack".into(), Value::String(stack.to_string()));
        db.insert(JOBS_TABLE, &[row], InsertMode::Replace)
            .await
            .map_err(PopulateError::Registry)
    }

    /// Insert an ignore record for a key.
    ///
    /// Returns `false` when a record already exists; an existing record is
    /// never overwritten.
    pub async fn ignore(
        db: &dyn Backend,
        target_name: &str,
        key: &Key,
    ) -> Result<bool, PopulateError> {
        let row = base_record(target_name, key, JobStatus::Ignore);
        match db.insert(JOBS_TABLE, &[row], InsertMode::Strict).await {
            Ok(()) => Ok(true),
            Err(BackendError::Duplicate { .. }) => Ok(false),
            Err(e) => Err(PopulateError::Registry(e)),
        }
    }

    /// Key digests with a record for this target, under any status.
    ///
    /// The todo computer subtracts these before dispatch.
    pub async fn blocked_digests(
        db: &dyn Backend,
        target_name: &str,
    ) -> Result<HashSet<String>, PopulateError> {
        let expr = Expression::from(Self::table_ref())
            .restrict(Restriction::eq("target_table_name", target_name))
            .project(&["key_hash".to_string()]);
        let rows = db.fetch(&expr).await.map_err(PopulateError::Registry)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.get("key_hash") {
                Some(Value::String(digest)) => Some(digest.clone()),
                _ => None,
            })
            .collect())
    }

    /// Error records for a target, for inspection.
    pub async fn errors(
        db: &dyn Backend,
        target_name: &str,
    ) -> Result<Vec<Row>, PopulateError> {
        let mut restriction = Row::new();
        restriction.insert("target_table_name".into(), Value::String(target_name.into()));
        restriction.insert(
            "status".into(),
            Value::String(JobStatus::Error.as_str().into()),
        );
        let expr =
            Expression::from(Self::table_ref()).restrict(Restriction::Attrs(restriction));
        db.fetch(&expr).await.map_err(PopulateError::Registry)
    }

    /// Remove every record for a target. Returns the number removed.
    pub async fn purge(db: &dyn Backend, target_name: &str) -> Result<u64, PopulateError> {
        db.delete(
            JOBS_TABLE,
            &[Restriction::eq("target_table_name", target_name)],
        )
        .await
        .map_err(PopulateError::Registry)
    }
}

fn base_record(target_name: &str, key: &Key, status: JobStatus) -> Row {
    let mut row = Row::new();
    row.insert(
        "target_table_name".into(),
        Value::String(target_name.to_string()),
    );
    row.insert("key_hash".into(), Value::String(key.digest()));
    row.insert("status".into(), Value::String(status.as_str().to_string()));
    row.insert("key".into(), key.to_blob());
    row.insert("error_message".into(), Value::String(String::new()));
    row.insert("error_stack".into(), Value::String(String::new()));
    row.insert("user".into(), Value::String(String::new()));
    row.insert("host".into(), Value::String(String::new()));
    row.insert("pid".into(), Value::from(0u32));
    row.insert("connection_id".into(), Value::from(0u64));
    row.insert(
        "timestamp".into(),
        Value::String(Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()),
    );
    row
}

fn record_restriction(target_name: &str, key: &Key) -> Vec<Restriction> {
    let mut row = Row::new();
    row.insert(
        "target_table_name".into(),
        Value::String(target_name.to_string()),
    );
    row.insert("key_hash".into(), Value::String(key.digest()));
    vec![Restriction::Attrs(row)]
}

/// Truncate an error message to the column capacity, marking the cut.
pub fn truncate_message(message: &str) -> String {
    if message.len() <= ERROR_MESSAGE_LIMIT {
        return message.to_string();
    }
    let keep = ERROR_MESSAGE_LIMIT - TRUNCATION_SUFFIX.len();
    let mut cut = keep;
    // Back off to a character boundary
    while cut > 0 && !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &message[..cut], TRUNCATION_SUFFIX)
}
