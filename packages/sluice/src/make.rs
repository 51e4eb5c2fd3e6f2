//! The make contract: user procedures that produce derived rows.
//!
//! A make procedure takes one key and produces the derived row(s) for it.
//! It comes in two shapes:
//!
//! - [`Make`] - a single callable that fetches, computes, and inserts. The
//!   whole invocation runs inside one transaction.
//! - [`TripartiteMake`] - `fetch`/`compute`/`insert` split apart so that an
//!   expensive compute runs outside the transaction. The engine re-fetches
//!   and verifies before inserting (see the invoker).
//!
//! Make code talks to the database exclusively through [`MakeContext`].
//! The context doubles as the insert capability: an auto-populated table
//! accepts inserts from its make context and refuses them elsewhere, which
//! is what keeps derived rows' provenance honest.
//!
//! Extra parameters a procedure needs - model settings, thresholds,
//! client handles - are fields of the implementing type.

use async_trait::async_trait;
use serde::Serialize;

use crate::backend::{Backend, InsertMode};
use crate::error::BackendError;
use crate::expr::{Expression, Row};
use crate::key::Key;
use crate::table::TableSchema;

/// What a make invocation produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MakeOutcome {
    /// The derived rows were inserted and committed.
    Populated,
    /// The key was already present in the target at pre-check time
    /// (another worker populated it first). Nothing was invoked.
    AlreadyPresent,
}

/// Database surface handed to make procedures.
///
/// Holding a `MakeContext` is the permission to insert into the target;
/// there is no process-wide flag to raise or lower.
pub struct MakeContext<'a> {
    db: &'a dyn Backend,
    target: &'a TableSchema,
}

impl<'a> MakeContext<'a> {
    pub(crate) fn new(db: &'a dyn Backend, target: &'a TableSchema) -> Self {
        Self { db, target }
    }

    /// The target table being populated.
    pub fn target(&self) -> &TableSchema {
        self.target
    }

    /// Fetch upstream data.
    pub async fn fetch(&self, expr: &Expression) -> Result<Vec<Row>, BackendError> {
        self.db.fetch(expr).await
    }

    /// Insert derived rows into the target.
    ///
    /// This is the capability path that bypasses the direct-insert guard;
    /// within a transaction the rows land with the commit.
    pub async fn insert(&self, rows: &[Row]) -> Result<(), BackendError> {
        self.db
            .insert(&self.target.name, rows, InsertMode::Strict)
            .await
    }
}

/// Single-phase make: fetch, compute, and insert in one callable.
#[async_trait]
pub trait Make: Send + Sync {
    /// Produce and insert the derived rows for `key`.
    async fn make(&self, key: &Key, ctx: &MakeContext<'_>) -> anyhow::Result<()>;
}

/// Three-phase make: fetch and insert bracket a transaction-free compute.
///
/// `fetch` must be a pure read of upstream data: the engine calls it twice
/// (once before compute, once inside the transaction) and compares deep
/// structural digests of the results. `Fetched` therefore has to serialize
/// deterministically - which every plain data type does.
#[async_trait]
pub trait TripartiteMake: Send + Sync {
    /// Upstream data needed by the computation.
    type Fetched: Serialize + Send;
    /// The computed result to insert.
    type Computed: Send;

    /// Read the upstream data for `key`.
    async fn fetch(&self, key: &Key, ctx: &MakeContext<'_>) -> anyhow::Result<Self::Fetched>;

    /// Compute the result. Runs outside any transaction; may take
    /// arbitrarily long without holding locks.
    async fn compute(&self, key: &Key, fetched: Self::Fetched)
        -> anyhow::Result<Self::Computed>;

    /// Insert the computed rows for `key`. Runs inside the transaction,
    /// after the re-fetch verification passed.
    async fn insert(
        &self,
        key: &Key,
        computed: Self::Computed,
        ctx: &MakeContext<'_>,
    ) -> anyhow::Result<()>;
}
