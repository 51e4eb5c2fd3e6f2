//! Orchestrator-level populate scenarios against the in-memory backend.

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use common::{key, pipeline, row};
use sluice::{
    Backend, JobsRegistry, Key, Make, MakeContext, MemoryStore, OrderPolicy, PopulateError,
    PopulateOptions, ShutdownToken, SinglePhase,
};

fn trial_id(key: &Key) -> anyhow::Result<i64> {
    key.get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow::anyhow!("key has no id"))
}

/// Inserts `{id, value: id * 10}` for every key.
struct TimesTen;

#[async_trait]
impl Make for TimesTen {
    async fn make(&self, key: &Key, ctx: &MakeContext<'_>) -> anyhow::Result<()> {
        let id = trial_id(key)?;
        ctx.insert(&[row(&[("id", json!(id)), ("value", json!(id * 10))])])
            .await?;
        Ok(())
    }
}

/// Like `TimesTen` but fails with "bad input" for one id.
struct FailingMake {
    bad: i64,
}

#[async_trait]
impl Make for FailingMake {
    async fn make(&self, key: &Key, ctx: &MakeContext<'_>) -> anyhow::Result<()> {
        let id = trial_id(key)?;
        if id == self.bad {
            anyhow::bail!("bad input");
        }
        ctx.insert(&[row(&[("id", json!(id)), ("value", json!(id * 10))])])
            .await?;
        Ok(())
    }
}

/// Records the order keys were made in.
struct RecordingMake {
    order: Arc<Mutex<Vec<i64>>>,
}

#[async_trait]
impl Make for RecordingMake {
    async fn make(&self, key: &Key, ctx: &MakeContext<'_>) -> anyhow::Result<()> {
        let id = trial_id(key)?;
        self.order.lock().unwrap().push(id);
        ctx.insert(&[row(&[("id", json!(id)), ("value", json!(id * 10))])])
            .await?;
        Ok(())
    }
}

/// Requests shutdown while making one particular key.
struct CancellingMake {
    token: ShutdownToken,
    cancel_at: i64,
}

#[async_trait]
impl Make for CancellingMake {
    async fn make(&self, key: &Key, ctx: &MakeContext<'_>) -> anyhow::Result<()> {
        let id = trial_id(key)?;
        if id == self.cancel_at {
            self.token.cancel();
        }
        ctx.insert(&[row(&[("id", json!(id)), ("value", json!(id * 10))])])
            .await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_single_phase_populates_every_key() {
    let p = pipeline(&[1, 2, 3]).await;
    let summary = p
        .driver()
        .populate(
            &p.schema,
            Arc::new(SinglePhase(TimesTen)),
            PopulateOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(summary.success_count, 3);
    assert!(summary.errors.is_empty());
    assert_eq!(p.target_ids(), vec![1, 2, 3]);
    assert_eq!(p.target_value(1), Some(json!(10)));
    assert_eq!(p.target_value(2), Some(json!(20)));
    assert_eq!(p.target_value(3), Some(json!(30)));
}

#[tokio::test]
async fn test_second_populate_finds_nothing_to_do() {
    let p = pipeline(&[1, 2, 3]).await;
    let driver = p.driver();
    driver
        .populate(
            &p.schema,
            Arc::new(SinglePhase(TimesTen)),
            PopulateOptions::default(),
        )
        .await
        .unwrap();

    let again = driver
        .populate(
            &p.schema,
            Arc::new(SinglePhase(TimesTen)),
            PopulateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(again.success_count, 0);
    assert!(again.errors.is_empty());
    assert_eq!(p.target_ids().len(), 3);
}

#[tokio::test]
async fn test_empty_todo_returns_empty_summary() {
    let p = pipeline(&[]).await;
    let summary = p
        .driver()
        .populate(
            &p.schema,
            Arc::new(SinglePhase(TimesTen)),
            PopulateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(summary.success_count, 0);
    assert!(summary.errors.is_empty());
}

#[tokio::test]
async fn test_failure_bookkeeping_with_suppression() {
    let p = pipeline(&[1, 2, 3, 4, 5]).await;
    let summary = p
        .driver()
        .populate(
            &p.schema,
            Arc::new(SinglePhase(FailingMake { bad: 5 })),
            PopulateOptions::builder()
                .suppress_errors(true)
                .reserve_jobs(true)
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(summary.success_count, 4);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].key, key(5));
    assert!(matches!(
        summary.errors[0].error,
        PopulateError::Make { .. }
    ));
    assert!(summary.error_messages()[0].contains("bad input"));

    // No derived row for the failed key
    assert_eq!(p.target_ids(), vec![1, 2, 3, 4]);

    // Exactly one error record, carrying the message
    let db = p.backend();
    let errors = JobsRegistry::errors(&db, p.target()).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].get("error_message"), Some(&json!("bad input")));
    assert_eq!(errors[0].get("key_hash"), Some(&json!(key(5).digest())));
}

#[tokio::test]
async fn test_failure_propagates_without_suppression() {
    let p = pipeline(&[1, 2, 3]).await;
    let result = p
        .driver()
        .populate(
            &p.schema,
            Arc::new(SinglePhase(FailingMake { bad: 2 })),
            PopulateOptions::builder().reserve_jobs(true).build(),
        )
        .await;

    assert!(matches!(result, Err(PopulateError::Make { .. })));
    // Key 1 was made, key 2 rolled back, key 3 never attempted
    assert_eq!(p.target_ids(), vec![1]);

    let db = p.backend();
    let errors = JobsRegistry::errors(&db, p.target()).await.unwrap();
    assert_eq!(errors.len(), 1);
    // Only the error record survives: key 1's reservation was completed
    // and key 3 was never reserved
    let blocked = JobsRegistry::blocked_digests(&db, p.target()).await.unwrap();
    assert_eq!(blocked.len(), 1);
    assert!(blocked.contains(&key(2).digest()));
}

#[tokio::test]
async fn test_ignored_key_is_skipped_silently() {
    let p = pipeline(&[6, 7, 8]).await;
    let db = p.backend();
    db.ensure_registry().await.unwrap();
    assert!(JobsRegistry::ignore(&db, p.target(), &key(7)).await.unwrap());

    let summary = p
        .driver()
        .populate(
            &p.schema,
            Arc::new(SinglePhase(TimesTen)),
            PopulateOptions::builder().reserve_jobs(true).build(),
        )
        .await
        .unwrap();

    assert_eq!(summary.success_count, 2);
    assert!(summary.errors.is_empty());
    assert_eq!(p.target_ids(), vec![6, 8]);
}

#[tokio::test]
async fn test_limit_zero_makes_nothing() {
    let p = pipeline(&[1, 2, 3]).await;
    let summary = p
        .driver()
        .populate(
            &p.schema,
            Arc::new(SinglePhase(TimesTen)),
            PopulateOptions::builder().limit(Some(0u64)).build(),
        )
        .await
        .unwrap();
    assert_eq!(summary.success_count, 0);
    assert!(p.target_ids().is_empty());
}

#[tokio::test]
async fn test_max_calls_zero_makes_nothing() {
    let p = pipeline(&[1, 2, 3]).await;
    let summary = p
        .driver()
        .populate(
            &p.schema,
            Arc::new(SinglePhase(TimesTen)),
            PopulateOptions::builder().max_calls(Some(0usize)).build(),
        )
        .await
        .unwrap();
    assert_eq!(summary.success_count, 0);
    assert!(p.target_ids().is_empty());
}

#[tokio::test]
async fn test_max_calls_caps_invocations() {
    let p = pipeline(&[1, 2, 3, 4]).await;
    let summary = p
        .driver()
        .populate(
            &p.schema,
            Arc::new(SinglePhase(TimesTen)),
            PopulateOptions::builder().max_calls(Some(2usize)).build(),
        )
        .await
        .unwrap();
    assert_eq!(summary.success_count, 2);
    assert_eq!(p.target_ids(), vec![1, 2]);
}

#[tokio::test]
async fn test_limit_applies_before_registry_filter() {
    // limit caps the fetch BEFORE blocked keys are removed, so a blocked
    // key inside the limit window shrinks the dispatchable set
    let p = pipeline(&[1, 2, 3, 4]).await;
    let db = p.backend();
    db.ensure_registry().await.unwrap();
    JobsRegistry::ignore(&db, p.target(), &key(1)).await.unwrap();

    let summary = p
        .driver()
        .populate(
            &p.schema,
            Arc::new(SinglePhase(TimesTen)),
            PopulateOptions::builder()
                .limit(Some(2u64))
                .reserve_jobs(true)
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(summary.success_count, 1);
    assert_eq!(p.target_ids(), vec![2]);
}

#[tokio::test]
async fn test_reverse_order() {
    let p = pipeline(&[1, 2, 3]).await;
    let order = Arc::new(Mutex::new(Vec::new()));
    p.driver()
        .populate(
            &p.schema,
            Arc::new(SinglePhase(RecordingMake {
                order: order.clone(),
            })),
            PopulateOptions::builder().order(OrderPolicy::Reverse).build(),
        )
        .await
        .unwrap();
    assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
}

#[tokio::test]
async fn test_random_order_makes_everything() {
    let p = pipeline(&[1, 2, 3, 4, 5]).await;
    let summary = p
        .driver()
        .populate(
            &p.schema,
            Arc::new(SinglePhase(TimesTen)),
            PopulateOptions::builder().order(OrderPolicy::Random).build(),
        )
        .await
        .unwrap();
    assert_eq!(summary.success_count, 5);
    assert_eq!(p.target_ids(), vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_explicit_keys_bypass_todo_query() {
    let p = pipeline(&[1, 2, 3, 4]).await;
    let summary = p
        .driver()
        .populate(
            &p.schema,
            Arc::new(SinglePhase(TimesTen)),
            PopulateOptions::builder()
                .keys(Some(vec![key(2), key(4)]))
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(summary.success_count, 2);
    assert_eq!(p.target_ids(), vec![2, 4]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_pool_populates_exactly_once() {
    common::init_tracing();
    let ids: Vec<i64> = (1..=30).collect();
    let p = pipeline(&ids).await;
    let summary = p
        .driver()
        .populate(
            &p.schema,
            Arc::new(SinglePhase(TimesTen)),
            PopulateOptions::builder()
                .reserve_jobs(true)
                .processes(3usize)
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(summary.success_count, 30);
    assert!(summary.errors.is_empty());
    assert_eq!(p.target_ids(), ids);

    // All reservations cleared
    let db = p.backend();
    let blocked = JobsRegistry::blocked_digests(&db, p.target()).await.unwrap();
    assert!(blocked.is_empty());
}

#[tokio::test]
async fn test_shutdown_unwinds_and_records_in_flight_key() {
    common::init_tracing();
    let p = pipeline(&(1..=10).collect::<Vec<_>>()).await;
    let token = ShutdownToken::new();
    let result = p
        .driver()
        .populate(
            &p.schema,
            Arc::new(SinglePhase(CancellingMake {
                token: token.clone(),
                cancel_at: 4,
            })),
            PopulateOptions::builder()
                .reserve_jobs(true)
                // Suppression must not swallow the shutdown
                .suppress_errors(true)
                .shutdown(Some(token))
                .build(),
        )
        .await;

    assert!(matches!(result, Err(PopulateError::ShutdownRequested)));
    // Keys before the interrupted one survive; the in-flight key rolled back
    assert_eq!(p.target_ids(), vec![1, 2, 3]);

    let db = p.backend();
    let errors = JobsRegistry::errors(&db, p.target()).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].get("key_hash"), Some(&json!(key(4).digest())));
    let message = errors[0]
        .get("error_message")
        .and_then(Value::as_str)
        .unwrap();
    assert!(message.contains("shutdown"));
}

#[tokio::test]
async fn test_progress_reports_remaining_and_total() {
    let p = pipeline(&[1, 2, 3, 4]).await;
    let driver = p.driver();
    driver
        .populate(
            &p.schema,
            Arc::new(SinglePhase(TimesTen)),
            PopulateOptions::builder().max_calls(Some(3usize)).build(),
        )
        .await
        .unwrap();

    let progress = driver.progress(&p.schema, &[]).await.unwrap();
    assert_eq!(progress.total, 4);
    assert_eq!(progress.remaining, 1);
}

#[tokio::test]
async fn test_aliased_foreign_key_projects_with_renaming() {
    use sluice::{
        InsertMode, MemoryBackend, MemoryConnector, ParentLink, PopulateDriver, TableRef,
        TableSchema,
    };

    let store = MemoryStore::new();
    store.create_table("lab.subject", &["subject"]);
    store.create_table("lab.graft", &["donor"]);
    let db = MemoryBackend::connect(store.clone());
    db.insert(
        "lab.subject",
        &[row(&[("subject", json!(1))]), row(&[("subject", json!(2))])],
        InsertMode::Strict,
    )
    .await
    .unwrap();

    let graft = TableSchema::builder()
        .name("lab.graft")
        .heading(vec!["donor".to_string(), "value".to_string()])
        .primary_key(vec!["donor".to_string()])
        .parents(vec![ParentLink::builder()
            .table(TableRef::new("lab.subject", &["subject"]))
            .primary_key(vec!["subject".to_string()])
            .renames(vec![("subject".to_string(), "donor".to_string())])
            .build()])
        .build();

    struct GraftMake;

    #[async_trait]
    impl Make for GraftMake {
        async fn make(&self, key: &Key, ctx: &MakeContext<'_>) -> anyhow::Result<()> {
            let donor = key
                .get("donor")
                .and_then(Value::as_i64)
                .ok_or_else(|| anyhow::anyhow!("key has no donor"))?;
            ctx.insert(&[row(&[("donor", json!(donor)), ("value", json!(donor + 100))])])
                .await?;
            Ok(())
        }
    }

    let driver = PopulateDriver::new(Arc::new(MemoryConnector::new(store.clone())));
    let summary = driver
        .populate(&graft, Arc::new(SinglePhase(GraftMake)), PopulateOptions::default())
        .await
        .unwrap();

    assert_eq!(summary.success_count, 2);
    let donors: Vec<i64> = store
        .table_rows("lab.graft")
        .iter()
        .filter_map(|r| r.get("donor").and_then(Value::as_i64))
        .collect();
    assert_eq!(donors.len(), 2);
}
