//! Shared fixtures for integration tests.
//!
//! Each [`Pipeline`] is a tiny two-table setup: an upstream parent and a
//! derived target with primary key `{id}` plus one payload column. Table
//! names are unique per fixture so tests populating in parallel threads
//! never trip the per-process re-entrance guard on each other.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use serde_json::{json, Value};

use sluice::{
    Backend, InsertMode, Key, MemoryBackend, MemoryConnector, MemoryStore, ParentLink,
    PopulateDriver, Row, TableRef, TableSchema,
};

static NEXT_PIPELINE: AtomicUsize = AtomicUsize::new(0);
static TRACING: Once = Once::new();

/// Route engine logs through `RUST_LOG` when debugging a test run.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

pub fn key(id: i64) -> Key {
    Key::new(vec![("id".into(), json!(id))])
}

/// One isolated parent/target pair on its own store.
pub struct Pipeline {
    pub store: Arc<MemoryStore>,
    pub parent: String,
    pub schema: TableSchema,
}

/// Build a pipeline with the parent seeded with `ids`. The target has
/// heading `{id, value}` and primary key `{id}`.
pub async fn pipeline(ids: &[i64]) -> Pipeline {
    let n = NEXT_PIPELINE.fetch_add(1, Ordering::SeqCst);
    let parent = format!("lab.trial_{n}");
    let target = format!("lab.trial_stats_{n}");

    let store = MemoryStore::new();
    store.create_table(&parent, &["id"]);
    store.create_table(&target, &["id"]);

    let schema = TableSchema::builder()
        .name(target)
        .heading(vec!["id".to_string(), "value".to_string()])
        .primary_key(vec!["id".to_string()])
        .parents(vec![ParentLink::builder()
            .table(TableRef::new(parent.clone(), &["id"]))
            .primary_key(vec!["id".to_string()])
            .build()])
        .build();

    let fixture = Pipeline {
        store,
        parent,
        schema,
    };
    fixture.seed(ids).await;
    fixture
}

impl Pipeline {
    /// Insert parent rows.
    pub async fn seed(&self, ids: &[i64]) {
        if ids.is_empty() {
            return;
        }
        let rows: Vec<Row> = ids.iter().map(|id| row(&[("id", json!(id))])).collect();
        self.backend()
            .insert(&self.parent, &rows, InsertMode::Strict)
            .await
            .unwrap();
    }

    /// A populate driver over this pipeline's store.
    pub fn driver(&self) -> PopulateDriver {
        PopulateDriver::new(Arc::new(MemoryConnector::new(self.store.clone())))
    }

    /// A fresh raw connection onto this pipeline's store.
    pub fn backend(&self) -> MemoryBackend {
        MemoryBackend::connect(self.store.clone())
    }

    /// The target's full name.
    pub fn target(&self) -> &str {
        &self.schema.name
    }

    /// The id of every row currently in the target, sorted.
    pub fn target_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .store
            .table_rows(self.target())
            .iter()
            .filter_map(|r| r.get("id").and_then(Value::as_i64))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// The `value` column for one target id, if the row exists.
    pub fn target_value(&self, id: i64) -> Option<Value> {
        self.store
            .table_rows(self.target())
            .iter()
            .find(|r| r.get("id").and_then(Value::as_i64) == Some(id))
            .and_then(|r| r.get("value").cloned())
    }
}
