//! Make invocation protocols.
//!
//! One key, one transaction. The invoker owns the transaction discipline
//! around a make procedure:
//!
//! ```text
//! SinglePhase                      ThreePhase
//!     │                                │
//!     ├─► begin transaction           ├─► fetch (no transaction)
//!     ├─► pre-check target            ├─► digest fetched data
//!     ├─► make(key)                   ├─► compute (no transaction, no locks)
//!     └─► commit / rollback           ├─► begin transaction
//!                                     ├─► pre-check target
//!                                     ├─► re-fetch + digest compare
//!                                     ├─► insert(key, computed)
//!                                     └─► commit / rollback
//! ```
//!
//! The pre-check catches the race where another worker populated the key
//! after the todo set was computed; it returns
//! [`MakeOutcome::AlreadyPresent`] without invoking anything. The digest
//! comparison catches upstream data changing underneath the
//! out-of-transaction compute; a mismatch discards the result and reports
//! a referential-integrity failure for the key.
//!
//! Rollback on the failure paths is best-effort: if the rollback itself
//! fails (connection dropped mid-unwind), the failure is logged and
//! swallowed so the original error still reaches the caller.

use async_trait::async_trait;
use tracing::{debug, error};

use crate::backend::Backend;
use crate::error::{BackendError, PopulateError};
use crate::expr::{Expression, Restriction};
use crate::hash::deep_hash_of;
use crate::key::Key;
use crate::make::{Make, MakeContext, MakeOutcome, TripartiteMake};
use crate::shutdown::ShutdownToken;
use crate::table::TableSchema;

/// One make procedure bound to its invocation protocol.
///
/// The orchestrator drives keys through this trait without knowing which
/// shape the user supplied; [`SinglePhase`] and [`ThreePhase`] adapt the
/// two make traits.
#[async_trait]
pub trait MakeProcedure: Send + Sync {
    /// Run the protocol for one key.
    async fn run(
        &self,
        db: &dyn Backend,
        target: &TableSchema,
        key: &Key,
        shutdown: &ShutdownToken,
    ) -> Result<MakeOutcome, PopulateError>;
}

/// Adapter running a [`Make`] under the single-phase protocol.
pub struct SinglePhase<M>(pub M);

/// Adapter running a [`TripartiteMake`] under the three-phase protocol.
pub struct ThreePhase<T>(pub T);

#[async_trait]
impl<M: Make> MakeProcedure for SinglePhase<M> {
    async fn run(
        &self,
        db: &dyn Backend,
        target: &TableSchema,
        key: &Key,
        shutdown: &ShutdownToken,
    ) -> Result<MakeOutcome, PopulateError> {
        shutdown.check()?;
        begin(db).await?;

        match key_present(db, target, key).await {
            Ok(true) => {
                rollback_quietly(db).await;
                return Ok(MakeOutcome::AlreadyPresent);
            }
            Ok(false) => {}
            Err(e) => {
                rollback_quietly(db).await;
                return Err(e.into());
            }
        }

        let ctx = MakeContext::new(db, target);
        match self.0.make(key, &ctx).await {
            Ok(()) => {
                if shutdown.is_cancelled() {
                    rollback_quietly(db).await;
                    return Err(PopulateError::ShutdownRequested);
                }
                commit(db).await?;
                debug!(table = %target.name, key = %key, "made");
                Ok(MakeOutcome::Populated)
            }
            Err(e) => {
                rollback_quietly(db).await;
                Err(PopulateError::Make {
                    key: key.to_string(),
                    error: e,
                })
            }
        }
    }
}

#[async_trait]
impl<T: TripartiteMake> MakeProcedure for ThreePhase<T> {
    async fn run(
        &self,
        db: &dyn Backend,
        target: &TableSchema,
        key: &Key,
        shutdown: &ShutdownToken,
    ) -> Result<MakeOutcome, PopulateError> {
        shutdown.check()?;

        // Phase 1+2 run with no transaction open: the fetch observes
        // autocommit state and the compute holds no locks however long it
        // takes.
        let ctx = MakeContext::new(db, target);
        let fetched = self
            .0
            .fetch(key, &ctx)
            .await
            .map_err(|e| make_failure(key, e))?;
        let fetch_digest = deep_hash_of(&fetched)?;

        debug_assert!(!db.in_transaction(), "compute must run outside a transaction");
        let computed = self
            .0
            .compute(key, fetched)
            .await
            .map_err(|e| make_failure(key, e))?;

        shutdown.check()?;
        begin(db).await?;

        match key_present(db, target, key).await {
            Ok(true) => {
                rollback_quietly(db).await;
                return Ok(MakeOutcome::AlreadyPresent);
            }
            Ok(false) => {}
            Err(e) => {
                rollback_quietly(db).await;
                return Err(e.into());
            }
        }

        // Verify the inputs did not change underneath the computation.
        let refetched = match self.0.fetch(key, &ctx).await {
            Ok(data) => data,
            Err(e) => {
                rollback_quietly(db).await;
                return Err(make_failure(key, e));
            }
        };
        let refetch_digest = match deep_hash_of(&refetched) {
            Ok(digest) => digest,
            Err(e) => {
                rollback_quietly(db).await;
                return Err(e);
            }
        };
        if refetch_digest != fetch_digest {
            rollback_quietly(db).await;
            return Err(PopulateError::ReferentialIntegrity {
                key: key.to_string(),
            });
        }

        match self.0.insert(key, computed, &ctx).await {
            Ok(()) => {
                if shutdown.is_cancelled() {
                    rollback_quietly(db).await;
                    return Err(PopulateError::ShutdownRequested);
                }
                commit(db).await?;
                debug!(table = %target.name, key = %key, "made");
                Ok(MakeOutcome::Populated)
            }
            Err(e) => {
                rollback_quietly(db).await;
                Err(make_failure(key, e))
            }
        }
    }
}

fn make_failure(key: &Key, error: anyhow::Error) -> PopulateError {
    PopulateError::Make {
        key: key.to_string(),
        error,
    }
}

async fn begin(db: &dyn Backend) -> Result<(), PopulateError> {
    db.begin_transaction().await.map_err(|e| match e {
        BackendError::NestedTransaction => PopulateError::NestedTransaction,
        other => PopulateError::Backend(other),
    })
}

async fn commit(db: &dyn Backend) -> Result<(), PopulateError> {
    match db.commit_transaction().await {
        Ok(()) => Ok(()),
        Err(e) => {
            // The commit may have failed after partially unwinding; make
            // sure nothing is left open before reporting.
            rollback_quietly(db).await;
            Err(PopulateError::Backend(e))
        }
    }
}

async fn rollback_quietly(db: &dyn Backend) {
    if !db.in_transaction() {
        return;
    }
    if let Err(e) = db.rollback_transaction().await {
        error!(error = %e, "rollback failed during error handling");
    }
}

/// Whether the key already has a row in the target.
async fn key_present(
    db: &dyn Backend,
    target: &TableSchema,
    key: &Key,
) -> Result<bool, BackendError> {
    let expr = Expression::from(target.table_ref())
        .restrict(Restriction::Attrs(key.to_row()))
        .project(&target.primary_key)
        .limit(1);
    Ok(!db.fetch(&expr).await?.is_empty())
}
