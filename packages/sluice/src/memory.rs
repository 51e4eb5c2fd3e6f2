//! In-memory storage backend.
//!
//! `MemoryStore` holds tables behind a process-local lock; every
//! [`MemoryBackend`] handle created from it acts as one "connection" with
//! its own transaction buffer and connection id. The handle gives
//! read-committed visibility plus read-your-own-writes: reads see the
//! committed store with this connection's buffered inserts and deletes
//! applied on top, and commits re-validate uniqueness against the
//! committed state so two racing connections cannot both land the same
//! primary key.
//!
//! This backend is the reference semantics for the narrow interface and
//! the substrate for the test suite; production deployments use the SQL
//! backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::backend::{Backend, Connector, InsertMode, WorkerIdentity};
use crate::error::BackendError;
use crate::expr::{Expression, Restriction, Row};
use crate::jobs;
use crate::key::normalize_value;

struct TableData {
    primary_key: Vec<String>,
    rows: Vec<Row>,
}

/// Process-local table storage shared by any number of connections.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, TableData>>,
    next_connection: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Declare a table with its primary key. Re-declaring an existing table
    /// is a no-op.
    pub fn create_table(&self, name: &str, primary_key: &[&str]) {
        let mut tables = self.tables.write().expect("memory store lock poisoned");
        tables.entry(name.to_string()).or_insert_with(|| TableData {
            primary_key: primary_key.iter().map(|a| a.to_string()).collect(),
            rows: Vec::new(),
        });
    }

    /// Snapshot a table's committed rows, for assertions and seeding checks.
    pub fn table_rows(&self, name: &str) -> Vec<Row> {
        let tables = self.tables.read().expect("memory store lock poisoned");
        tables.get(name).map(|t| t.rows.clone()).unwrap_or_default()
    }

    fn primary_key_of(&self, name: &str) -> Result<Vec<String>, BackendError> {
        let tables = self.tables.read().expect("memory store lock poisoned");
        tables
            .get(name)
            .map(|t| t.primary_key.clone())
            .ok_or_else(|| BackendError::UnknownTable(name.to_string()))
    }

    fn apply_insert(
        &self,
        table: &str,
        rows: &[Row],
        mode: InsertMode,
    ) -> Result<(), BackendError> {
        let mut tables = self.tables.write().expect("memory store lock poisoned");
        let data = tables
            .get_mut(table)
            .ok_or_else(|| BackendError::UnknownTable(table.to_string()))?;

        // Validate against a working copy so a rejected batch changes nothing.
        let mut working = data.rows.clone();
        let pk = data.primary_key.clone();
        for row in rows {
            let incoming = pk_projection(row, &pk);
            if let Some(idx) = working
                .iter()
                .position(|existing| pk_projection(existing, &pk) == incoming)
            {
                match mode {
                    InsertMode::Strict => {
                        return Err(BackendError::Duplicate {
                            table: table.to_string(),
                        })
                    }
                    InsertMode::Replace => {
                        working.remove(idx);
                    }
                }
            }
            working.push(normalize_row(row));
        }
        data.rows = working;
        Ok(())
    }

    fn apply_delete(
        &self,
        table: &str,
        restrictions: &[Restriction],
    ) -> Result<u64, BackendError> {
        // Evaluate matches before taking the write lock
        for restriction in restrictions {
            if let Restriction::Sql(text) = restriction {
                return Err(BackendError::UnsupportedRestriction(text.clone()));
            }
        }
        let mut tables = self.tables.write().expect("memory store lock poisoned");
        let data = tables
            .get_mut(table)
            .ok_or_else(|| BackendError::UnknownTable(table.to_string()))?;
        let before = data.rows.len();
        data.rows
            .retain(|row| !matches_all(row, restrictions).unwrap_or(false));
        Ok((before - data.rows.len()) as u64)
    }
}

#[derive(Default)]
struct TxnBuffer {
    inserts: Vec<(String, Row, InsertMode)>,
    deletes: Vec<(String, Vec<Restriction>)>,
}

/// One in-memory connection.
pub struct MemoryBackend {
    store: Arc<MemoryStore>,
    connection_id: u64,
    txn: Mutex<Option<TxnBuffer>>,
}

impl MemoryBackend {
    /// Open a connection onto a shared store.
    pub fn connect(store: Arc<MemoryStore>) -> Self {
        let connection_id = store.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            store,
            connection_id,
            txn: Mutex::new(None),
        }
    }

    /// The shared store behind this connection.
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Committed rows overlaid with this connection's buffered writes.
    fn visible_rows(&self, table: &str) -> Result<Vec<Row>, BackendError> {
        let mut rows = {
            let tables = self.store.tables.read().expect("memory store lock poisoned");
            tables
                .get(table)
                .map(|t| t.rows.clone())
                .ok_or_else(|| BackendError::UnknownTable(table.to_string()))?
        };
        let txn = self.txn.lock().expect("transaction lock poisoned");
        if let Some(buffer) = txn.as_ref() {
            for (deleted_table, restrictions) in &buffer.deletes {
                if deleted_table == table {
                    rows.retain(|row| !matches_all(row, restrictions).unwrap_or(false));
                }
            }
            for (inserted_table, row, mode) in &buffer.inserts {
                if inserted_table == table {
                    if *mode == InsertMode::Replace {
                        let pk = self.store.primary_key_of(table)?;
                        let incoming = pk_projection(row, &pk);
                        rows.retain(|existing| pk_projection(existing, &pk) != incoming);
                    }
                    rows.push(row.clone());
                }
            }
        }
        Ok(rows)
    }

    fn eval(&self, expr: &Expression) -> Result<Vec<Row>, BackendError> {
        match expr {
            Expression::Table(table) => self.visible_rows(&table.name),
            Expression::Restrict { input, restrictions } => {
                let rows = self.eval(input)?;
                let mut kept = Vec::new();
                for row in rows {
                    if matches_all(&row, restrictions)? {
                        kept.push(row);
                    }
                }
                Ok(kept)
            }
            Expression::Project { input, attrs } => {
                let rows = self.eval(input)?;
                rows.into_iter()
                    .map(|row| {
                        let mut projected = Row::new();
                        for attr in attrs {
                            let value = row.get(&attr.source).cloned().ok_or_else(|| {
                                BackendError::UnknownAttribute {
                                    attribute: attr.source.clone(),
                                    context: "projection".into(),
                                }
                            })?;
                            projected.insert(attr.alias.clone(), value);
                        }
                        Ok(projected)
                    })
                    .collect()
            }
            Expression::Join { left, right } => {
                let shared = shared_attrs(&left.heading(), &right.heading());
                let left_rows = self.eval(left)?;
                let right_rows = self.eval(right)?;
                let mut joined = Vec::new();
                for l in &left_rows {
                    for r in &right_rows {
                        if shared
                            .iter()
                            .all(|attr| values_equal(l.get(attr), r.get(attr)))
                        {
                            let mut row = l.clone();
                            for (k, v) in r {
                                row.entry(k.clone()).or_insert_with(|| v.clone());
                            }
                            joined.push(row);
                        }
                    }
                }
                Ok(joined)
            }
            Expression::Subtract { left, right } => {
                let shared = shared_attrs(&left.heading(), &right.heading());
                let left_rows = self.eval(left)?;
                let right_rows = self.eval(right)?;
                Ok(left_rows
                    .into_iter()
                    .filter(|l| {
                        !right_rows.iter().any(|r| {
                            shared
                                .iter()
                                .all(|attr| values_equal(l.get(attr), r.get(attr)))
                        })
                    })
                    .collect())
            }
            Expression::Limit { input, n } => {
                let mut rows = self.eval(input)?;
                rows.truncate(*n as usize);
                Ok(rows)
            }
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn fetch(&self, expr: &Expression) -> Result<Vec<Row>, BackendError> {
        self.eval(expr)
    }

    async fn insert(
        &self,
        table: &str,
        rows: &[Row],
        mode: InsertMode,
    ) -> Result<(), BackendError> {
        let in_txn = self.txn.lock().expect("transaction lock poisoned").is_some();
        if !in_txn {
            return self.store.apply_insert(table, rows, mode);
        }

        // Buffered path: reject duplicates against the currently visible
        // state now, and again against the committed state at commit time.
        if mode == InsertMode::Strict {
            let pk = self.store.primary_key_of(table)?;
            let visible = self.visible_rows(table)?;
            for row in rows {
                let incoming = pk_projection(row, &pk);
                if visible
                    .iter()
                    .any(|existing| pk_projection(existing, &pk) == incoming)
                {
                    return Err(BackendError::Duplicate {
                        table: table.to_string(),
                    });
                }
            }
        }
        let mut txn = self.txn.lock().expect("transaction lock poisoned");
        let buffer = txn.as_mut().expect("transaction closed mid-insert");
        for row in rows {
            buffer
                .inserts
                .push((table.to_string(), normalize_row(row), mode));
        }
        Ok(())
    }

    async fn delete(
        &self,
        table: &str,
        restrictions: &[Restriction],
    ) -> Result<u64, BackendError> {
        let mut txn = self.txn.lock().expect("transaction lock poisoned");
        if let Some(buffer) = txn.as_mut() {
            let matched = self
                .store
                .table_rows(table)
                .iter()
                .filter(|row| matches_all(row, restrictions).unwrap_or(false))
                .count() as u64;
            buffer
                .deletes
                .push((table.to_string(), restrictions.to_vec()));
            return Ok(matched);
        }
        drop(txn);
        self.store.apply_delete(table, restrictions)
    }

    async fn begin_transaction(&self) -> Result<(), BackendError> {
        let mut txn = self.txn.lock().expect("transaction lock poisoned");
        if txn.is_some() {
            return Err(BackendError::NestedTransaction);
        }
        *txn = Some(TxnBuffer::default());
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<(), BackendError> {
        let buffer = {
            let mut txn = self.txn.lock().expect("transaction lock poisoned");
            txn.take().ok_or(BackendError::NoTransaction)?
        };
        // The buffer is applied atomically; a uniqueness conflict discards
        // it entirely, which is the commit-time race re-check.
        for (table, restrictions) in &buffer.deletes {
            self.store.apply_delete(table, restrictions)?;
        }
        for (table, row, mode) in &buffer.inserts {
            self.store.apply_insert(table, std::slice::from_ref(row), *mode)?;
        }
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<(), BackendError> {
        let mut txn = self.txn.lock().expect("transaction lock poisoned");
        txn.take().ok_or(BackendError::NoTransaction)?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.txn.lock().expect("transaction lock poisoned").is_some()
    }

    async fn identity(&self) -> Result<WorkerIdentity, BackendError> {
        Ok(WorkerIdentity {
            user: std::env::var("USER").unwrap_or_else(|_| "unknown".into()),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into()),
            pid: std::process::id(),
            connection_id: self.connection_id,
        })
    }

    async fn ensure_registry(&self) -> Result<(), BackendError> {
        self.store
            .create_table(jobs::JOBS_TABLE, &jobs::JOBS_PRIMARY_KEY);
        Ok(())
    }
}

/// Connector handing out fresh connections onto one shared store.
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
}

impl MemoryConnector {
    /// Wrap a shared store.
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Backend>, BackendError> {
        Ok(Arc::new(MemoryBackend::connect(self.store.clone())))
    }
}

fn pk_projection(row: &Row, primary_key: &[String]) -> Vec<Option<serde_json::Value>> {
    primary_key
        .iter()
        .map(|attr| row.get(attr).cloned().map(normalize_value))
        .collect()
}

fn normalize_row(row: &Row) -> Row {
    row.iter()
        .map(|(k, v)| (k.clone(), normalize_value(v.clone())))
        .collect()
}

fn values_equal(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => normalize_value(a.clone()) == normalize_value(b.clone()),
        _ => false,
    }
}

fn matches_all(row: &Row, restrictions: &[Restriction]) -> Result<bool, BackendError> {
    for restriction in restrictions {
        if !matches_one(row, restriction)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_one(row: &Row, restriction: &Restriction) -> Result<bool, BackendError> {
    match restriction {
        Restriction::Attrs(attrs) => Ok(attrs.iter().all(|(attr, value)| {
            // Attributes outside the row's heading do not restrict
            match row.get(attr) {
                Some(actual) => {
                    normalize_value(actual.clone()) == normalize_value(value.clone())
                }
                None => true,
            }
        })),
        Restriction::AnyOf(options) => {
            for option in options {
                if matches_one(row, &Restriction::Attrs(option.clone()))? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Restriction::Sql(text) => Err(BackendError::UnsupportedRestriction(text.clone())),
    }
}

fn shared_attrs(left: &[String], right: &[String]) -> Vec<String> {
    left.iter()
        .filter(|attr| right.contains(attr))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::TableRef;
    use serde_json::json;

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.create_table("lab.subject", &["subject"]);
        store
    }

    #[tokio::test]
    async fn test_strict_insert_rejects_duplicates() {
        let store = seeded_store();
        let db = MemoryBackend::connect(store);
        db.insert("lab.subject", &[row(&[("subject", json!(1))])], InsertMode::Strict)
            .await
            .unwrap();
        let err = db
            .insert("lab.subject", &[row(&[("subject", json!(1))])], InsertMode::Strict)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn test_replace_overwrites() {
        let store = seeded_store();
        store.create_table("lab.note", &["subject"]);
        let db = MemoryBackend::connect(store.clone());
        db.insert(
            "lab.note",
            &[row(&[("subject", json!(1)), ("text", json!("a"))])],
            InsertMode::Strict,
        )
        .await
        .unwrap();
        db.insert(
            "lab.note",
            &[row(&[("subject", json!(1)), ("text", json!("b"))])],
            InsertMode::Replace,
        )
        .await
        .unwrap();
        let rows = store.table_rows("lab.note");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("text"), Some(&json!("b")));
    }

    #[tokio::test]
    async fn test_rollback_discards_buffered_writes() {
        let store = seeded_store();
        let db = MemoryBackend::connect(store.clone());
        db.begin_transaction().await.unwrap();
        db.insert("lab.subject", &[row(&[("subject", json!(7))])], InsertMode::Strict)
            .await
            .unwrap();
        assert!(db.in_transaction());
        db.rollback_transaction().await.unwrap();
        assert!(store.table_rows("lab.subject").is_empty());
        assert!(!db.in_transaction());
    }

    #[tokio::test]
    async fn test_transaction_reads_own_writes() {
        let store = seeded_store();
        let db = MemoryBackend::connect(store.clone());
        db.begin_transaction().await.unwrap();
        db.insert("lab.subject", &[row(&[("subject", json!(7))])], InsertMode::Strict)
            .await
            .unwrap();
        let table = TableRef::new("lab.subject", &["subject"]);
        let rows = db.fetch(&Expression::from(table)).await.unwrap();
        assert_eq!(rows.len(), 1);
        // Not visible to other connections until commit
        assert!(store.table_rows("lab.subject").is_empty());
        db.commit_transaction().await.unwrap();
        assert_eq!(store.table_rows("lab.subject").len(), 1);
    }

    #[tokio::test]
    async fn test_commit_recheck_rejects_racing_duplicate() {
        let store = seeded_store();
        let a = MemoryBackend::connect(store.clone());
        let b = MemoryBackend::connect(store.clone());
        a.begin_transaction().await.unwrap();
        a.insert("lab.subject", &[row(&[("subject", json!(1))])], InsertMode::Strict)
            .await
            .unwrap();
        // b lands the same key first
        b.insert("lab.subject", &[row(&[("subject", json!(1))])], InsertMode::Strict)
            .await
            .unwrap();
        let err = a.commit_transaction().await.unwrap_err();
        assert!(matches!(err, BackendError::Duplicate { .. }));
        assert_eq!(store.table_rows("lab.subject").len(), 1);
    }

    #[tokio::test]
    async fn test_transactions_do_not_nest() {
        let db = MemoryBackend::connect(seeded_store());
        db.begin_transaction().await.unwrap();
        let err = db.begin_transaction().await.unwrap_err();
        assert!(matches!(err, BackendError::NestedTransaction));
    }

    #[tokio::test]
    async fn test_natural_join_and_subtract() {
        let store = seeded_store();
        store.create_table("lab.session", &["subject", "session"]);
        store.create_table("lab.done", &["subject", "session"]);
        let db = MemoryBackend::connect(store);
        db.insert("lab.subject", &[row(&[("subject", json!(1))]), row(&[("subject", json!(2))])], InsertMode::Strict)
            .await
            .unwrap();
        db.insert(
            "lab.session",
            &[
                row(&[("subject", json!(1)), ("session", json!(1))]),
                row(&[("subject", json!(2)), ("session", json!(1))]),
            ],
            InsertMode::Strict,
        )
        .await
        .unwrap();
        db.insert(
            "lab.done",
            &[row(&[("subject", json!(1)), ("session", json!(1))])],
            InsertMode::Strict,
        )
        .await
        .unwrap();

        let subjects = TableRef::new("lab.subject", &["subject"]);
        let sessions = TableRef::new("lab.session", &["subject", "session"]);
        let done = TableRef::new("lab.done", &["subject", "session"]);
        let expr = Expression::from(subjects)
            .join(sessions.into())
            .subtract(done.into());
        let rows = db.fetch(&expr).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("subject"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_sql_restriction_is_unsupported() {
        let db = MemoryBackend::connect(seeded_store());
        let table = TableRef::new("lab.subject", &["subject"]);
        let expr = Expression::from(table).restrict(Restriction::Sql("subject > 1".into()));
        let err = db.fetch(&expr).await.unwrap_err();
        assert!(matches!(err, BackendError::UnsupportedRestriction(_)));
    }

    #[tokio::test]
    async fn test_connection_ids_are_distinct() {
        let store = seeded_store();
        let a = MemoryBackend::connect(store.clone());
        let b = MemoryBackend::connect(store);
        let ia = a.identity().await.unwrap();
        let ib = b.identity().await.unwrap();
        assert_ne!(ia.connection_id, ib.connection_id);
    }
}
