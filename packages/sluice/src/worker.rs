//! Worker loops and optional pool fan-out.
//!
//! Every worker - including the sole worker of an in-process populate -
//! runs the same loop: pull the next key from a shared queue, reserve it
//! if reservations are on, drive the make protocol, record the outcome.
//! Between workers there is no coordination beyond the jobs registry's
//! uniqueness constraint; a lost reservation is a skip, not an error.
//!
//! With fan-out, each worker opens its own connection through the
//! [`Connector`] - connections never cross workers - and keys are handed
//! out one at a time in todo order. The dispatch stream preserves that
//! order; the registry remains the final arbiter of who makes what.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, Connector};
use crate::error::{BackendError, PopulateError};
use crate::invoker::MakeProcedure;
use crate::jobs::JobsRegistry;
use crate::key::Key;
use crate::make::MakeOutcome;
use crate::populate::PopulateFailure;
use crate::shutdown::ShutdownToken;
use crate::table::TableSchema;

/// Keys awaiting dispatch, consumed one at a time in order.
pub(crate) struct KeyQueue {
    keys: Vec<Key>,
    cursor: AtomicUsize,
    aborted: AtomicBool,
}

impl KeyQueue {
    pub(crate) fn new(keys: Vec<Key>) -> Arc<Self> {
        Arc::new(Self {
            keys,
            cursor: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
        })
    }

    fn next(&self) -> Option<&Key> {
        if self.aborted.load(Ordering::SeqCst) {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.keys.get(idx)
    }

    /// Stop handing out keys; in-flight keys finish or unwind on their own.
    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// Everything a worker needs besides its connection.
pub(crate) struct WorkerContext {
    pub target: TableSchema,
    pub procedure: Arc<dyn MakeProcedure>,
    pub reserve_jobs: bool,
    pub suppress_errors: bool,
    pub shutdown: ShutdownToken,
}

/// What one worker accomplished.
#[derive(Debug, Default)]
pub(crate) struct WorkerReport {
    pub success_count: usize,
    pub errors: Vec<PopulateFailure>,
}

/// Run one worker until the queue drains, a failure propagates, or
/// shutdown is requested.
pub(crate) async fn process_keys(
    db: Arc<dyn Backend>,
    ctx: &WorkerContext,
    queue: Arc<KeyQueue>,
    worker: &str,
) -> Result<WorkerReport, PopulateError> {
    let mut report = WorkerReport::default();
    let target = &ctx.target;

    while let Some(key) = queue.next() {
        ctx.shutdown.check()?;

        if ctx.reserve_jobs {
            match JobsRegistry::reserve(db.as_ref(), &target.name, key).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(worker, table = %target.name, key = %key, "reservation lost; skipping");
                    continue;
                }
                Err(e) => {
                    // Registry failures are never a per-key matter
                    queue.abort();
                    return Err(e);
                }
            }
        }

        match ctx
            .procedure
            .run(db.as_ref(), target, key, &ctx.shutdown)
            .await
        {
            Ok(MakeOutcome::Populated) => {
                if ctx.reserve_jobs {
                    JobsRegistry::complete(db.as_ref(), &target.name, key).await?;
                }
                report.success_count += 1;
            }
            Ok(MakeOutcome::AlreadyPresent) => {
                // Another worker beat us to the row since the todo set was
                // computed; release the reservation and move on.
                debug!(worker, table = %target.name, key = %key, "already present; skipping");
                if ctx.reserve_jobs {
                    JobsRegistry::complete(db.as_ref(), &target.name, key).await?;
                }
            }
            Err(failure) => {
                if ctx.reserve_jobs {
                    record_failure(db.as_ref(), target, key, &failure).await;
                }
                if ctx.suppress_errors && failure.is_suppressible() {
                    warn!(worker, table = %target.name, key = %key, error = %failure, "make failed; continuing");
                    report.errors.push(PopulateFailure {
                        key: key.clone(),
                        error: failure,
                    });
                } else {
                    queue.abort();
                    return Err(failure);
                }
            }
        }
    }

    Ok(report)
}

/// Fan out over `processes` workers, each with its own connection.
///
/// The caller drops its own handle before invoking this; the parent
/// connection does not survive into the pool.
pub(crate) async fn run_pool(
    connector: Arc<dyn Connector>,
    ctx: Arc<WorkerContext>,
    queue: Arc<KeyQueue>,
    processes: usize,
) -> Result<WorkerReport, PopulateError> {
    info!(processes, table = %ctx.target.name, "starting worker pool");

    let mut handles = Vec::with_capacity(processes);
    for index in 0..processes {
        let connector = connector.clone();
        let ctx = ctx.clone();
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let worker = format!("worker-{index}");
            let db = connector.connect().await.map_err(PopulateError::from)?;
            let result = process_keys(db, &ctx, queue, &worker).await;
            info!(worker = %worker, "worker stopped");
            result
        }));
    }

    let mut combined = WorkerReport::default();
    let mut first_failure: Option<PopulateError> = None;
    for joined in join_all(handles).await {
        match joined {
            Ok(Ok(report)) => {
                combined.success_count += report.success_count;
                combined.errors.extend(report.errors);
            }
            Ok(Err(e)) => {
                queue.abort();
                first_failure.get_or_insert(e);
            }
            Err(join_error) => {
                queue.abort();
                first_failure.get_or_insert(PopulateError::Backend(BackendError::Query(
                    format!("worker task failed: {join_error}"),
                )));
            }
        }
    }

    match first_failure {
        Some(e) => Err(e),
        None => Ok(combined),
    }
}

/// Best-effort error record for a failed key. A failure to write the
/// record is logged and swallowed so the original failure propagates.
async fn record_failure(
    db: &dyn Backend,
    target: &TableSchema,
    key: &Key,
    failure: &PopulateError,
) {
    let (message, stack) = match failure {
        PopulateError::Make { error, .. } => (error.to_string(), format!("{error:?}")),
        other => (other.to_string(), String::new()),
    };
    if let Err(e) = JobsRegistry::error(db, &target.name, key, &message, &stack).await {
        error!(table = %target.name, key = %key, error = %e, "failed to write error record");
    }
}
