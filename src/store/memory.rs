//! In-memory store with an operation journal and fault injection.
//!
//! Lets tests assert the order of destructive operations and simulate
//! timeouts, connection failures and lost writes. Inserts append without
//! checking `row_id`, so a repeated write shows up as a duplicate row.

use super::{
    PreparedInsert, SearchHit, StoreResult, StoredRow, TableDescription, TableSchema, VectorStore,
};
use crate::connection::Connector;
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A mutating operation, recorded in the order it was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Create(String),
    Drop(String),
    Truncate(String),
    InsertRows { table: String, rows: usize },
    InsertRow(String),
    DeleteRows { table: String, rows: usize },
    Optimize(String),
}

/// Which call a fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTarget {
    InsertRows,
    InsertRow,
    CreateTable,
    DropTable,
    Truncate,
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Fails with `StoreError::Timeout` without applying the write.
    Timeout,
    /// Applies the write, then reports a timeout.
    TimeoutAfterApply,
    /// Fails with a non-retriable query error.
    Query,
    /// Reports success but silently keeps one row less.
    LoseOneRow,
}

#[derive(Debug, Clone)]
struct Fault {
    target: FaultTarget,
    table_prefix: String,
    /// Matching calls to let through before the fault fires.
    skip: usize,
    /// How many times the fault fires.
    times: usize,
    kind: FaultKind,
}

#[derive(Debug, Default)]
struct Table {
    dimension: usize,
    rows: Vec<StoredRow>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<String, Table>,
    journal: Vec<StoreOp>,
    faults: Vec<Fault>,
    open_sessions: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create `table` holding `rows` generated rows of `dimension`.
    pub fn seed(&self, table: &str, dimension: usize, rows: usize) {
        let mut inner = self.lock();
        let entry = inner.tables.entry(table.to_string()).or_insert_with(|| Table {
            dimension,
            rows: Vec::new(),
        });
        for index in 0..rows {
            entry.rows.push(StoredRow {
                row_id: format!("{table}-seed-{index}"),
                vector: vec![index as f32; dimension],
                body_blob: format!("seeded row {index} of {table}"),
                metadata: BTreeMap::new(),
            });
        }
    }

    pub fn inject(
        &self,
        target: FaultTarget,
        table_prefix: &str,
        skip: usize,
        times: usize,
        kind: FaultKind,
    ) {
        self.lock().faults.push(Fault {
            target,
            table_prefix: table_prefix.to_string(),
            skip,
            times,
            kind,
        });
    }

    pub fn journal(&self) -> Vec<StoreOp> {
        self.lock().journal.clone()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.lock().tables.keys().cloned().collect()
    }

    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.lock()
            .tables
            .get(table)
            .map(|table| table.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.lock().tables.get(table).map(|table| table.rows.len())
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    fn take_fault(inner: &mut Inner, target: FaultTarget, table: &str) -> Option<FaultKind> {
        let fault = inner.faults.iter_mut().find(|fault| {
            fault.target == target && fault.times > 0 && table.starts_with(&fault.table_prefix)
        })?;
        if fault.skip > 0 {
            fault.skip -= 1;
            return None;
        }
        fault.times -= 1;
        Some(fault.kind)
    }

    fn table_mut<'a>(inner: &'a mut Inner, table: &str) -> StoreResult<&'a mut Table> {
        inner
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }

    fn table<'a>(inner: &'a Inner, table: &str) -> StoreResult<&'a Table> {
        inner
            .tables
            .get(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }

    fn write_rows(&self, table: &str, rows: &[StoredRow], target: FaultTarget) -> StoreResult<()> {
        let mut inner = self.lock();
        let fault = Self::take_fault(&mut inner, target, table);
        match fault {
            Some(FaultKind::Timeout) => {
                return Err(StoreError::Timeout(format!("write to {table} timed out")));
            }
            Some(FaultKind::Query) => {
                return Err(StoreError::Query(format!("write to {table} rejected")));
            }
            _ => {}
        }

        let entry = Self::table_mut(&mut inner, table)?;
        if let Some(row) = rows.iter().find(|row| row.vector.len() != entry.dimension) {
            return Err(StoreError::SchemaMismatch {
                table: table.to_string(),
                detail: format!(
                    "row {} has {} dimensions, table expects {}",
                    row.row_id,
                    row.vector.len(),
                    entry.dimension
                ),
            });
        }

        let keep = if fault == Some(FaultKind::LoseOneRow) {
            rows.len().saturating_sub(1)
        } else {
            rows.len()
        };
        entry.rows.extend_from_slice(&rows[..keep]);

        inner.journal.push(match target {
            FaultTarget::InsertRow => StoreOp::InsertRow(table.to_string()),
            _ => StoreOp::InsertRows {
                table: table.to_string(),
                rows: rows.len(),
            },
        });

        if fault == Some(FaultKind::TimeoutAfterApply) {
            return Err(StoreError::Timeout(format!(
                "write to {table} timed out after commit"
            )));
        }
        Ok(())
    }
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn list_tables(&self) -> StoreResult<Vec<String>> {
        Ok(self.table_names())
    }

    async fn create_table(&self, table: &str, schema: TableSchema) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some(kind) = Self::take_fault(&mut inner, FaultTarget::CreateTable, table) {
            return Err(match kind {
                FaultKind::Timeout | FaultKind::TimeoutAfterApply => {
                    StoreError::Timeout(format!("create {table} timed out"))
                }
                _ => StoreError::Query(format!("create {table} rejected")),
            });
        }
        if inner.tables.contains_key(table) {
            return Err(StoreError::TableExists(table.to_string()));
        }
        inner.tables.insert(
            table.to_string(),
            Table {
                dimension: schema.dimension,
                rows: Vec::new(),
            },
        );
        inner.journal.push(StoreOp::Create(table.to_string()));
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        if Self::take_fault(&mut inner, FaultTarget::DropTable, table).is_some() {
            return Err(StoreError::Timeout(format!("drop {table} timed out")));
        }
        if inner.tables.remove(table).is_some() {
            inner.journal.push(StoreOp::Drop(table.to_string()));
        }
        Ok(())
    }

    async fn describe_table(&self, table: &str) -> StoreResult<TableDescription> {
        let inner = self.lock();
        let entry = Self::table(&inner, table)?;
        Ok(TableDescription {
            columns: TableSchema::required_fields()
                .iter()
                .map(|field| field.to_string())
                .collect(),
            dimension: Some(entry.dimension),
        })
    }

    async fn count_rows(&self, table: &str) -> StoreResult<usize> {
        let inner = self.lock();
        Ok(Self::table(&inner, table)?.rows.len())
    }

    async fn insert_rows(&self, table: &str, rows: &[StoredRow]) -> StoreResult<()> {
        self.write_rows(table, rows, FaultTarget::InsertRows)
    }

    async fn delete_rows(&self, table: &str, row_ids: &[String]) -> StoreResult<()> {
        let mut inner = self.lock();
        let entry = Self::table_mut(&mut inner, table)?;
        let before = entry.rows.len();
        entry.rows.retain(|row| !row_ids.contains(&row.row_id));
        let removed = before - entry.rows.len();
        inner.journal.push(StoreOp::DeleteRows {
            table: table.to_string(),
            rows: removed,
        });
        Ok(())
    }

    async fn truncate(&self, table: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some(kind) = Self::take_fault(&mut inner, FaultTarget::Truncate, table) {
            return Err(match kind {
                FaultKind::Query => StoreError::Query(format!("truncate {table} rejected")),
                _ => StoreError::Timeout(format!("truncate {table} timed out")),
            });
        }
        Self::table_mut(&mut inner, table)?.rows.clear();
        inner.journal.push(StoreOp::Truncate(table.to_string()));
        Ok(())
    }

    async fn optimize(&self, table: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        Self::table(&inner, table)?;
        inner.journal.push(StoreOp::Optimize(table.to_string()));
        Ok(())
    }

    async fn list_row_ids(&self, table: &str) -> StoreResult<Vec<String>> {
        let inner = self.lock();
        Ok(Self::table(&inner, table)?
            .rows
            .iter()
            .map(|row| row.row_id.clone())
            .collect())
    }

    async fn fetch_row(&self, table: &str, row_id: &str) -> StoreResult<Option<StoredRow>> {
        let inner = self.lock();
        Ok(Self::table(&inner, table)?
            .rows
            .iter()
            .find(|row| row.row_id == row_id)
            .cloned())
    }

    async fn sample_rows(&self, table: &str, limit: usize) -> StoreResult<Vec<StoredRow>> {
        let inner = self.lock();
        Ok(Self::table(&inner, table)?
            .rows
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn nearest(
        &self,
        table: &str,
        vector: &[f32],
        limit: usize,
    ) -> StoreResult<Vec<SearchHit>> {
        let mut inner = self.lock();
        if Self::take_fault(&mut inner, FaultTarget::Nearest, table).is_some() {
            return Err(StoreError::Query(format!("search on {table} failed")));
        }
        let entry = Self::table(&inner, table)?;
        if vector.len() != entry.dimension {
            return Err(StoreError::SchemaMismatch {
                table: table.to_string(),
                detail: format!(
                    "query has {} dimensions, table expects {}",
                    vector.len(),
                    entry.dimension
                ),
            });
        }
        let mut hits: Vec<SearchHit> = entry
            .rows
            .iter()
            .map(|row| SearchHit {
                row_id: row.row_id.clone(),
                body_blob: row.body_blob.clone(),
                distance: squared_distance(&row.vector, vector),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn prepare_insert(&self, table: &str) -> StoreResult<Box<dyn PreparedInsert>> {
        let inner = self.lock();
        Self::table(&inner, table)?;
        Ok(Box::new(MemoryInsert {
            store: self.clone(),
            table: table.to_string(),
        }))
    }

    async fn close(&self) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.open_sessions = inner.open_sessions.saturating_sub(1);
        Ok(())
    }
}

struct MemoryInsert {
    store: MemoryStore,
    table: String,
}

#[async_trait]
impl PreparedInsert for MemoryInsert {
    async fn execute(&self, row: &StoredRow) -> StoreResult<()> {
        self.store
            .write_rows(&self.table, std::slice::from_ref(row), FaultTarget::InsertRow)
    }
}

/// Hands out sessions on a shared [`MemoryStore`], optionally failing the
/// first few attempts.
pub struct MemoryConnector {
    store: MemoryStore,
    failures_left: AtomicU32,
    attempts: AtomicU32,
}

impl MemoryConnector {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            failures_left: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn fail_first(self, failures: u32) -> Self {
        self.failures_left.store(failures, Ordering::SeqCst);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> StoreResult<Arc<dyn VectorStore>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Connection(format!(
                "simulated connection failure (attempt {attempt})"
            )));
        }
        self.store.lock().open_sessions += 1;
        Ok(Arc::new(self.store.clone()))
    }

    fn endpoint(&self) -> String {
        "memory://".to_string()
    }
}
