//! The populate orchestrator.
//!
//! `PopulateDriver::populate` is the top-level loop: resolve the key
//! source, compute the todo set, then drive every key through reserve →
//! make → complete/error, in process or fanned out over a worker pool.
//!
//! # Example
//!
//! ```ignore
//! let driver = PopulateDriver::new(Arc::new(MySqlConnector::from_env()?));
//! let summary = driver
//!     .populate(
//!         &trial_stats,
//!         Arc::new(ThreePhase(TrialStatsMake::default())),
//!         PopulateOptions::builder()
//!             .reserve_jobs(true)
//!             .order(OrderPolicy::Random)
//!             .processes(4)
//!             .build(),
//!     )
//!     .await?;
//! info!(made = summary.success_count, failed = summary.errors.len(), "populate done");
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use lazy_static::lazy_static;
use tracing::info;
use typed_builder::TypedBuilder;

use crate::backend::{Backend as _, Connector};
use crate::error::PopulateError;
use crate::expr::Restriction;
use crate::invoker::MakeProcedure;
use crate::key::Key;
use crate::shutdown::ShutdownToken;
use crate::table::TableSchema;
use crate::todo::{self, OrderPolicy};
use crate::worker::{self, KeyQueue, WorkerContext};

lazy_static! {
    /// Tables currently inside a populate call in this process.
    /// Re-entrance per table is disallowed.
    static ref POPULATING: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Options for a populate call.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct PopulateOptions {
    /// Restrictions conjoined onto the key source. Empty restricts nothing.
    #[builder(default)]
    pub restrictions: Vec<Restriction>,

    /// Explicit keys to attempt, bypassing the todo query. Ordering,
    /// registry filtering, and `max_calls` still apply.
    #[builder(default)]
    pub keys: Option<Vec<Key>>,

    /// Collect per-key make failures into the summary instead of
    /// unwinding on the first one. Shutdown and registry failures unwind
    /// regardless.
    #[builder(default)]
    pub suppress_errors: bool,

    /// Coordinate with competing workers through the jobs registry. Off by
    /// default: a single process needs no reservations.
    #[builder(default)]
    pub reserve_jobs: bool,

    /// Order in which keys are attempted.
    #[builder(default)]
    pub order: OrderPolicy,

    /// Server-side cap on the todo fetch. Applied before the registry
    /// filter - see the todo module for why that ordering is observable.
    #[builder(default)]
    pub limit: Option<u64>,

    /// Cap on make invocations, applied after the registry filter.
    #[builder(default)]
    pub max_calls: Option<usize>,

    /// Worker count; 1 runs in-process, more fan out with one connection
    /// per worker.
    #[builder(default = 1)]
    pub processes: usize,

    /// External shutdown token. When absent, the driver creates one and
    /// binds it to SIGTERM for the duration of the call.
    #[builder(default)]
    pub shutdown: Option<ShutdownToken>,
}

impl Default for PopulateOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A per-key failure collected under `suppress_errors`.
#[derive(Debug)]
pub struct PopulateFailure {
    /// The key whose make failed.
    pub key: Key,
    /// The failure.
    pub error: PopulateError,
}

/// What a populate call accomplished.
#[derive(Debug, Default)]
pub struct PopulateSummary {
    /// Keys successfully made and committed.
    pub success_count: usize,
    /// Collected per-key failures (empty unless `suppress_errors`).
    pub errors: Vec<PopulateFailure>,
}

impl PopulateSummary {
    /// The collected failures as formatted messages.
    pub fn error_messages(&self) -> Vec<String> {
        self.errors
            .iter()
            .map(|failure| format!("{}: {}", failure.key, failure.error))
            .collect()
    }
}

/// Population progress for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Keys not yet present in the target.
    pub remaining: usize,
    /// All keys the restricted key source produces.
    pub total: usize,
}

/// Drives population of derived tables over connections from a
/// [`Connector`].
pub struct PopulateDriver {
    connector: Arc<dyn Connector>,
}

impl PopulateDriver {
    /// Create a driver over a connection source.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Populate every missing key of `target` with `procedure`.
    ///
    /// Returns the summary of what was made and, under `suppress_errors`,
    /// which keys failed. Preconditions: the connection must have no open
    /// transaction, and the target must not already be populating in this
    /// process.
    pub async fn populate(
        &self,
        target: &TableSchema,
        procedure: Arc<dyn MakeProcedure>,
        opts: PopulateOptions,
    ) -> Result<PopulateSummary, PopulateError> {
        let _reentry = PopulatingEntry::acquire(&target.name)?;

        let db = self.connector.connect().await?;
        if db.in_transaction() {
            return Err(PopulateError::NestedTransaction);
        }

        let shutdown = opts.shutdown.clone().unwrap_or_default();
        let _signals = shutdown.bind_sigterm();

        if opts.reserve_jobs {
            db.ensure_registry().await?;
        }

        let mut keys = match &opts.keys {
            Some(explicit) => {
                // Re-canonicalize caller-built keys against the declared
                // primary key so their digests line up with the registry's
                let mut keys = explicit
                    .iter()
                    .map(|key| Key::from_row(&key.to_row(), &target.primary_key))
                    .collect::<Result<Vec<_>, _>>()?;
                todo::apply_order(&mut keys, opts.order);
                if opts.reserve_jobs {
                    keys = todo::filter_blocked(db.as_ref(), target, keys).await?;
                }
                keys
            }
            None => {
                todo::compute_todo(
                    db.as_ref(),
                    target,
                    &opts.restrictions,
                    opts.order,
                    opts.limit,
                    opts.reserve_jobs,
                    &shutdown,
                )
                .await?
            }
        };
        if let Some(max_calls) = opts.max_calls {
            keys.truncate(max_calls);
        }

        info!(
            table = %target.name,
            todo = keys.len(),
            processes = opts.processes,
            reserve_jobs = opts.reserve_jobs,
            "populate starting"
        );

        let queue = KeyQueue::new(keys);
        let ctx = WorkerContext {
            target: target.clone(),
            procedure,
            reserve_jobs: opts.reserve_jobs,
            suppress_errors: opts.suppress_errors,
            shutdown,
        };

        let report = if opts.processes <= 1 {
            worker::process_keys(db, &ctx, queue, "worker-0").await?
        } else {
            // Connections do not survive into the pool; every worker opens
            // its own.
            drop(db);
            worker::run_pool(self.connector.clone(), Arc::new(ctx), queue, opts.processes)
                .await?
        };

        let summary = PopulateSummary {
            success_count: report.success_count,
            errors: report.errors,
        };
        info!(
            table = %target.name,
            made = summary.success_count,
            failed = summary.errors.len(),
            "populate finished"
        );
        Ok(summary)
    }

    /// How much of `target` remains to be populated under `restrictions`.
    pub async fn progress(
        &self,
        target: &TableSchema,
        restrictions: &[Restriction],
    ) -> Result<Progress, PopulateError> {
        let db = self.connector.connect().await?;
        let source = target
            .key_source()?
            .restrict_all(restrictions.to_vec())
            .project(&target.primary_key);
        let total = db.fetch(&source).await?.len();
        let remaining = db
            .fetch(&source.subtract(target.table_ref().into()))
            .await?
            .len();
        Ok(Progress { remaining, total })
    }
}

/// RAII entry in the process-local populating set.
struct PopulatingEntry {
    table: String,
}

impl PopulatingEntry {
    fn acquire(table: &str) -> Result<Self, PopulateError> {
        let mut populating = POPULATING.lock().expect("populating set lock poisoned");
        if !populating.insert(table.to_string()) {
            return Err(PopulateError::Configuration {
                table: table.to_string(),
                reason: "already populating in this process".into(),
            });
        }
        Ok(Self {
            table: table.to_string(),
        })
    }
}

impl Drop for PopulatingEntry {
    fn drop(&mut self) {
        let mut populating = POPULATING.lock().expect("populating set lock poisoned");
        populating.remove(&self.table);
    }
}
