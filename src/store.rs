//! Vector store abstraction.
//!
//! The engine only talks to the store through [`VectorStore`]. The store has
//! no server-side insert-select and no atomic table swap, so everything the
//! promote protocol needs is expressed as count, scan-by-id and single-row
//! insert primitives.

pub mod lance;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

use crate::error::StoreError;
use crate::models::Record;
use async_trait::async_trait;
use std::collections::BTreeMap;

pub use lance::{LanceConnector, LanceStore};
#[cfg(any(test, feature = "test-utils"))]
pub use memory::{MemoryConnector, MemoryStore, StoreOp};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The fixed schema shared by target, staging and backup tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    pub dimension: usize,
}

impl TableSchema {
    pub const ROW_ID: &'static str = "row_id";
    pub const VECTOR: &'static str = "vector";
    pub const BODY: &'static str = "body_blob";
    pub const METADATA: &'static str = "metadata";

    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn required_fields() -> [&'static str; 4] {
        [Self::ROW_ID, Self::VECTOR, Self::BODY, Self::METADATA]
    }
}

/// One row as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub row_id: String,
    pub vector: Vec<f32>,
    pub body_blob: String,
    pub metadata: BTreeMap<String, String>,
}

impl From<Record> for StoredRow {
    fn from(record: Record) -> Self {
        Self {
            row_id: record.id,
            vector: record.vector,
            body_blob: record.text,
            metadata: record.metadata,
        }
    }
}

/// A nearest-neighbour match.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub row_id: String,
    pub body_blob: String,
    pub distance: f32,
}

/// Introspected shape of an existing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
    pub columns: Vec<String>,
    /// `None` when the vector column is missing or not a fixed-size list.
    pub dimension: Option<usize>,
}

impl TableDescription {
    pub fn missing_fields(&self) -> Vec<&'static str> {
        TableSchema::required_fields()
            .into_iter()
            .filter(|field| !self.columns.iter().any(|column| column == field))
            .collect()
    }
}

/// A session against the store. Owned by one phase at a time.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn list_tables(&self) -> StoreResult<Vec<String>>;

    async fn table_exists(&self, table: &str) -> StoreResult<bool> {
        Ok(self.list_tables().await?.iter().any(|name| name == table))
    }

    /// Create an empty table. Fails with `TableExists` if the name is taken.
    async fn create_table(&self, table: &str, schema: TableSchema) -> StoreResult<()>;

    /// Drop a table if it exists.
    async fn drop_table(&self, table: &str) -> StoreResult<()>;

    async fn describe_table(&self, table: &str) -> StoreResult<TableDescription>;

    async fn count_rows(&self, table: &str) -> StoreResult<usize>;

    /// Insert rows as one write.
    async fn insert_rows(&self, table: &str, rows: &[StoredRow]) -> StoreResult<()>;

    async fn delete_rows(&self, table: &str, row_ids: &[String]) -> StoreResult<()>;

    /// Remove every row, keeping the table.
    async fn truncate(&self, table: &str) -> StoreResult<()>;

    /// Compact the table's data files and prune superseded versions.
    async fn optimize(&self, table: &str) -> StoreResult<()>;

    async fn list_row_ids(&self, table: &str) -> StoreResult<Vec<String>>;

    async fn fetch_row(&self, table: &str, row_id: &str) -> StoreResult<Option<StoredRow>>;

    async fn sample_rows(&self, table: &str, limit: usize) -> StoreResult<Vec<StoredRow>>;

    async fn nearest(&self, table: &str, vector: &[f32], limit: usize)
    -> StoreResult<Vec<SearchHit>>;

    /// Prepare a single-row insert into `table` for repeated execution.
    async fn prepare_insert(&self, table: &str) -> StoreResult<Box<dyn PreparedInsert>>;

    /// Release the session. Called exactly once by the connection scope.
    async fn close(&self) -> StoreResult<()>;
}

/// A reusable single-row insert bound to one table.
#[async_trait]
pub trait PreparedInsert: Send + Sync {
    async fn execute(&self, row: &StoredRow) -> StoreResult<()>;
}
