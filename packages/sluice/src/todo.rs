//! The todo computer: which keys still need making, in what order.
//!
//! `(key_source ∧ restrictions) − target`, projected to the target's
//! primary key, fetched as a finite list and ordered client-side. The
//! result is recomputed on every populate call, never cached.
//!
//! Two caps apply at different points, and the difference is visible:
//! `limit` caps the fetch server-side BEFORE the jobs-registry filter,
//! while `max_calls` (the orchestrator's invocation cap) truncates AFTER
//! it. With
//! reservations enabled, `limit=100` can therefore yield fewer than 100
//! dispatchable keys even when a hundred unblocked keys exist.

use rand::seq::SliceRandom;
use tracing::debug;

use crate::backend::Backend;
use crate::error::PopulateError;
use crate::expr::Restriction;
use crate::jobs::JobsRegistry;
use crate::key::Key;
use crate::shutdown::ShutdownToken;
use crate::table::TableSchema;

/// Client-side ordering of the todo list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderPolicy {
    /// Whatever order the store returns. Ties and stability are the
    /// store's business; nothing depends on them.
    #[default]
    Original,
    /// Store order, reversed.
    Reverse,
    /// Uniformly shuffled. Spreads concurrent workers across the key space
    /// so they collide on reservations less often.
    Random,
}

/// Compute the ordered todo list for a target.
pub async fn compute_todo(
    db: &dyn Backend,
    target: &TableSchema,
    restrictions: &[Restriction],
    order: OrderPolicy,
    limit: Option<u64>,
    reserve_jobs: bool,
    shutdown: &ShutdownToken,
) -> Result<Vec<Key>, PopulateError> {
    shutdown.check()?;

    let mut expr = target
        .key_source()?
        .restrict_all(restrictions.to_vec())
        .project(&target.primary_key)
        .subtract(target.table_ref().into());
    if let Some(n) = limit {
        expr = expr.limit(n);
    }

    let rows = db.fetch(&expr).await?;
    let mut keys = rows
        .iter()
        .map(|row| Key::from_row(row, &target.primary_key))
        .collect::<Result<Vec<_>, _>>()?;

    apply_order(&mut keys, order);

    if reserve_jobs {
        keys = filter_blocked(db, target, keys).await?;
    }

    debug!(table = %target.name, todo = keys.len(), "computed todo set");
    Ok(keys)
}

/// Apply an ordering policy in place.
pub(crate) fn apply_order(keys: &mut [Key], order: OrderPolicy) {
    match order {
        OrderPolicy::Original => {}
        OrderPolicy::Reverse => keys.reverse(),
        OrderPolicy::Random => keys.shuffle(&mut rand::thread_rng()),
    }
}

/// Drop keys with a jobs-registry record for this target, whatever the
/// record's status.
pub(crate) async fn filter_blocked(
    db: &dyn Backend,
    target: &TableSchema,
    keys: Vec<Key>,
) -> Result<Vec<Key>, PopulateError> {
    let blocked = JobsRegistry::blocked_digests(db, &target.name).await?;
    if blocked.is_empty() {
        return Ok(keys);
    }
    Ok(keys
        .into_iter()
        .filter(|key| !blocked.contains(&key.digest()))
        .collect())
}
