//! Storage interface - the execution side of the narrow relational layer.
//!
//! The engine owns interfaces only. Everything it needs from a database is
//! expressed by [`Backend`]: evaluate an expression, insert and delete
//! rows, open exactly one transaction at a time, and report who this
//! connection is. Policy - SQL dialects, pooling, snapshot mechanics -
//! belongs to the implementations.
//!
//! # Implementer notes
//!
//! - `insert` with [`InsertMode::Strict`] must surface uniqueness-constraint
//!   rejections as [`BackendError::Duplicate`]. The engine relies on the
//!   constraint as the single arbiter between competing workers; never
//!   emulate it with locks.
//! - Transactions must not nest. `begin_transaction` with one open is a
//!   [`BackendError::NestedTransaction`]; there are no savepoints.
//! - Transactional reads should be snapshot-consistent with the
//!   transaction's start point where the store supports it (MySQL:
//!   `START TRANSACTION WITH CONSISTENT SNAPSHOT`).
//! - Connections are per-worker and never cross workers; a [`Connector`]
//!   makes fresh handles for pool fan-out.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::BackendError;
use crate::expr::{Expression, Restriction, Row};

/// How an insert treats an existing row with the same primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Reject with [`BackendError::Duplicate`].
    Strict,
    /// Replace the existing row (delete-then-insert semantics).
    Replace,
}

/// Who a connection is, as recorded on reservations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    /// Database user, e.g. `analysis@10.0.0.5`.
    pub user: String,
    /// Host the server sees, or the local hostname for embedded stores.
    pub host: String,
    /// Local process id.
    pub pid: u32,
    /// Server-side connection id.
    pub connection_id: u64,
}

/// One database connection.
///
/// All methods take `&self`; implementations guard their connection state
/// internally so a handle can be shared within one worker's call tree.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Evaluate an expression and return its rows.
    ///
    /// Inside a transaction, reads observe the transaction's snapshot plus
    /// this connection's own uncommitted writes.
    async fn fetch(&self, expr: &Expression) -> Result<Vec<Row>, BackendError>;

    /// Insert rows into a stored table.
    async fn insert(
        &self,
        table: &str,
        rows: &[Row],
        mode: InsertMode,
    ) -> Result<(), BackendError>;

    /// Delete rows matching the conjunction of restrictions. Returns the
    /// number of rows deleted; deleting nothing is not an error.
    async fn delete(
        &self,
        table: &str,
        restrictions: &[Restriction],
    ) -> Result<u64, BackendError>;

    /// Open a transaction. Fails with [`BackendError::NestedTransaction`]
    /// when one is already open on this connection.
    async fn begin_transaction(&self) -> Result<(), BackendError>;

    /// Commit the open transaction.
    async fn commit_transaction(&self) -> Result<(), BackendError>;

    /// Roll back the open transaction.
    async fn rollback_transaction(&self) -> Result<(), BackendError>;

    /// Whether a transaction is open on this connection.
    fn in_transaction(&self) -> bool;

    /// This connection's identity, as recorded on reservations.
    async fn identity(&self) -> Result<WorkerIdentity, BackendError>;

    /// Create the jobs registry table if it does not exist.
    async fn ensure_registry(&self) -> Result<(), BackendError>;
}

/// Establishes fresh connections, one per worker.
///
/// The worker pool closes the parent's handle before fan-out and gives each
/// worker its own connection; handles are never shared across workers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> Result<Arc<dyn Backend>, BackendError>;
}
