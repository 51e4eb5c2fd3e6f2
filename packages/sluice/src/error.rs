//! Structured error types for the populate engine.
//!
//! `PopulateError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. `BackendError` covers the storage layer underneath it.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses the populate boundary unwrapped.**
//!
//! - `anyhow` is internal transport for user make procedures (ergonomic for
//!   application code that fetches, computes, and inserts)
//! - `PopulateError::Make` is the only place it surfaces, paired with the
//!   key that failed
//!
//! # Normal outcomes are not errors
//!
//! Two conditions deliberately have **no** variant here:
//!
//! - a lost reservation (`JobsRegistry::reserve` returning `false`) - another
//!   worker owns the key, or a previous run recorded it
//! - a key already present in the target at pre-check time
//!   ([`MakeOutcome::AlreadyPresent`](crate::make::MakeOutcome))
//!
//! Both are routine results of running several workers against one schema.

use thiserror::Error;

/// Errors raised by storage backends implementing [`Backend`](crate::backend::Backend).
#[derive(Debug, Error)]
pub enum BackendError {
    /// An insert was rejected by a uniqueness constraint.
    ///
    /// For the jobs table this IS the reservation-lost signal; callers of
    /// `insert` with [`InsertMode::Strict`](crate::backend::InsertMode) are
    /// expected to match on this variant rather than treat it as fatal.
    #[error("duplicate key in table {table}")]
    Duplicate {
        /// The table that rejected the insert.
        table: String,
    },

    /// A transaction was opened while one is already in progress.
    ///
    /// Transactions never nest; there are no savepoints.
    #[error("a transaction is already open on this connection")]
    NestedTransaction,

    /// Commit or rollback was requested with no open transaction.
    #[error("no transaction is open on this connection")]
    NoTransaction,

    /// The backend cannot evaluate the given restriction.
    ///
    /// Raw SQL predicates, for example, are only meaningful to SQL backends.
    #[error("unsupported restriction: {0}")]
    UnsupportedRestriction(String),

    /// A referenced table has not been declared to this backend.
    #[error("unknown table {0}")]
    UnknownTable(String),

    /// An expression referenced an attribute missing from its input heading.
    #[error("unknown attribute {attribute} in {context}")]
    UnknownAttribute {
        /// The missing attribute name.
        attribute: String,
        /// Where it was referenced (projection, restriction, ...).
        context: String,
    },

    /// A query failed for a reason other than the above.
    #[error("query failed: {0}")]
    Query(String),

    /// The connection to the database was lost or could not be established.
    #[error("connection error: {0}")]
    Connection(String),
}

/// Errors raised by the populate engine.
///
/// The propagation policy lives in the orchestrator: with
/// `suppress_errors`, only [`PopulateError::Make`] and
/// [`PopulateError::ReferentialIntegrity`] are collected into the summary's
/// error list; every other variant unwinds `populate` immediately.
/// [`PopulateError::ShutdownRequested`] unwinds even when errors are
/// suppressed.
#[derive(Debug, Error)]
pub enum PopulateError {
    /// The target table is misconfigured for population.
    ///
    /// Raised at setup - before any key is attempted - and never suppressed.
    #[error("table {table} is misconfigured: {reason}")]
    Configuration {
        /// Full name of the target table.
        table: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The key source does not produce the target's full primary key.
    #[error("key source for {table} is missing primary key attributes: {missing:?}")]
    Schema {
        /// Full name of the target table.
        table: String,
        /// Primary-key attributes absent from the key source heading.
        missing: Vec<String>,
    },

    /// `populate` was called while a transaction is already open.
    #[error("populate requires a connection with no open transaction")]
    NestedTransaction,

    /// A direct insert was attempted on an auto-populated table.
    ///
    /// Derived rows must originate from a make invocation; pass
    /// `allow_direct` only when deliberately bypassing provenance.
    #[error("direct insert into auto-populated table {table}; insert from a make procedure or pass allow_direct")]
    DirectInsert {
        /// Full name of the table that refused the insert.
        table: String,
    },

    /// The three-phase re-fetch produced different data than the first fetch.
    ///
    /// The computed result is stale and was not inserted; the transaction
    /// was rolled back.
    #[error("fetched inputs for key {key} changed while computing; result discarded")]
    ReferentialIntegrity {
        /// Display form of the affected key.
        key: String,
    },

    /// The user make procedure returned an error.
    #[error("make failed for key {key}: {error}")]
    Make {
        /// Display form of the affected key.
        key: String,
        /// The underlying failure from user code.
        error: anyhow::Error,
    },

    /// The jobs registry failed for a reason other than a uniqueness rejection.
    ///
    /// Always propagates, even under `suppress_errors`.
    #[error("jobs registry operation failed: {0}")]
    Registry(#[source] BackendError),

    /// The storage backend failed outside the registry.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Cooperative shutdown was requested (SIGTERM or an explicit token).
    ///
    /// Always propagates; `suppress_errors` never swallows termination.
    #[error("populate interrupted by shutdown request")]
    ShutdownRequested,
}

impl PopulateError {
    /// Whether this failure is collected (rather than propagated) when the
    /// caller asked to suppress per-key errors.
    pub fn is_suppressible(&self) -> bool {
        matches!(
            self,
            PopulateError::Make { .. } | PopulateError::ReferentialIntegrity { .. }
        )
    }
}
