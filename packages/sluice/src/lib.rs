//! # Sluice
//!
//! A population engine for derived tables: key sources define the work,
//! make procedures compute the rows, and a jobs registry arbitrates
//! ownership between competing workers.
//!
//! ## Core Concepts
//!
//! A **derived table** declares where its keys come from (the **key
//! source**, a relational expression over its parents) and how one key
//! becomes rows (the **make** procedure). Population is the closure of
//! that declaration: every key the source produces that the table does not
//! yet contain gets made, exactly once, no matter how many workers on how
//! many hosts are populating at the same time.
//!
//! ## Architecture
//!
//! ```text
//! PopulateDriver.populate()
//!     │
//!     ├─► TableSchema.key_source()      resolve parents → expression
//!     ├─► todo::compute_todo()          (source ∧ restrictions) − target
//!     │
//!     ▼ per key (workers × connections)
//! JobsRegistry.reserve() ── lost ──► skip
//!     │ won
//!     ▼
//! MakeProcedure.run()                   single- or three-phase protocol
//!     │                                 (transaction, pre-check, verify)
//!     ├─ Populated ────► JobsRegistry.complete()
//!     ├─ AlreadyPresent ► JobsRegistry.complete()
//!     └─ failed ───────► JobsRegistry.error()  (truncated message + stack)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One record per key** - the registry's primary key admits at most
//!    one record per `(target, key-digest)`; the constraint, not a lock,
//!    arbitrates reservations
//! 2. **One key = one transaction** - makes commit or roll back whole;
//!    transactions never nest
//! 3. **Compute holds no locks** - the three-phase protocol runs compute
//!    outside the transaction and verifies the re-fetch by structural
//!    digest before inserting
//! 4. **Derived rows come from makes** - direct inserts into an
//!    auto-populated table are refused without an explicit override
//! 5. **Shutdown always unwinds** - SIGTERM rolls back the in-flight key,
//!    records the termination, and propagates even when per-key errors are
//!    suppressed

pub mod backend;
pub mod error;
pub mod expr;
pub mod hash;
pub mod invoker;
pub mod jobs;
pub mod key;
pub mod make;
pub mod memory;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod populate;
pub mod shutdown;
pub mod table;
pub mod todo;
pub(crate) mod worker;

pub use backend::{Backend, Connector, InsertMode, WorkerIdentity};
pub use error::{BackendError, PopulateError};
pub use expr::{Expression, ProjectedAttr, Restriction, Row, TableRef};
pub use hash::{deep_hash, deep_hash_of};
pub use invoker::{MakeProcedure, SinglePhase, ThreePhase};
pub use jobs::{JobStatus, JobsRegistry, ERROR_MESSAGE_LIMIT, JOBS_TABLE, TRUNCATION_SUFFIX};
pub use key::Key;
pub use make::{Make, MakeContext, MakeOutcome, TripartiteMake};
pub use memory::{MemoryBackend, MemoryConnector, MemoryStore};
#[cfg(feature = "mysql")]
pub use mysql::{MySqlBackend, MySqlConnector};
pub use populate::{
    PopulateDriver, PopulateFailure, PopulateOptions, PopulateSummary, Progress,
};
pub use shutdown::ShutdownToken;
pub use table::{ParentLink, TableSchema};
pub use todo::OrderPolicy;
