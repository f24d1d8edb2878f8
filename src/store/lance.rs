//! LanceDB implementation of the vector store.

use super::{
    PreparedInsert, SearchHit, StoreResult, StoredRow, TableDescription, TableSchema, VectorStore,
};
use crate::connection::Connector;
use crate::error::StoreError;
use arrow_array::cast::AsArray;
use arrow_array::types::Float32Type;
use arrow_array::{
    Array, ArrayRef, FixedSizeListArray, RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::table::OptimizeAction;
use std::collections::BTreeMap;
use std::sync::Arc;

fn store_error(error: lancedb::Error) -> StoreError {
    match error {
        lancedb::Error::TableNotFound { name, .. } => StoreError::MissingTable(name),
        lancedb::Error::TableAlreadyExists { name, .. } => StoreError::TableExists(name),
        other => StoreError::from_message(other.to_string()),
    }
}

fn arrow_error(error: arrow_schema::ArrowError) -> StoreError {
    StoreError::Query(error.to_string())
}

/// Arrow schema for target, staging and backup tables.
pub fn arrow_schema(dimension: usize) -> Schema {
    Schema::new(vec![
        Field::new(TableSchema::ROW_ID, DataType::Utf8, false),
        Field::new(
            TableSchema::VECTOR,
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                dimension as i32,
            ),
            false,
        ),
        Field::new(TableSchema::BODY, DataType::Utf8, false),
        Field::new(TableSchema::METADATA, DataType::Utf8, false),
    ])
}

fn record_batch(rows: &[StoredRow], dimension: usize) -> StoreResult<RecordBatch> {
    if let Some(row) = rows.iter().find(|row| row.vector.len() != dimension) {
        return Err(StoreError::SchemaMismatch {
            table: String::new(),
            detail: format!(
                "row {} has {} dimensions, expected {}",
                row.row_id,
                row.vector.len(),
                dimension
            ),
        });
    }

    let metadata = rows
        .iter()
        .map(|row| serde_json::to_string(&row.metadata))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::Query(format!("failed to encode metadata: {e}")))?;

    let ids = StringArray::from_iter_values(rows.iter().map(|row| row.row_id.as_str()));
    let bodies = StringArray::from_iter_values(rows.iter().map(|row| row.body_blob.as_str()));
    let metadata = StringArray::from_iter_values(metadata.iter().map(String::as_str));
    let vectors = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
        rows.iter()
            .map(|row| Some(row.vector.iter().map(|v| Some(*v)).collect::<Vec<_>>())),
        dimension as i32,
    );

    RecordBatch::try_new(
        Arc::new(arrow_schema(dimension)),
        vec![
            Arc::new(ids) as ArrayRef,
            Arc::new(vectors) as ArrayRef,
            Arc::new(bodies) as ArrayRef,
            Arc::new(metadata) as ArrayRef,
        ],
    )
    .map_err(arrow_error)
}

fn mismatch(detail: String) -> StoreError {
    StoreError::SchemaMismatch {
        table: String::new(),
        detail,
    }
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> StoreResult<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| mismatch(format!("result is missing column {name}")))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> StoreResult<&'a StringArray> {
    column(batch, name)?
        .as_string_opt::<i32>()
        .ok_or_else(|| mismatch(format!("column {name} is not a string column")))
}

/// Decode stored rows from a result batch. Rows with a null id are skipped.
fn rows_from_batch(batch: &RecordBatch) -> StoreResult<Vec<StoredRow>> {
    let ids = string_column(batch, TableSchema::ROW_ID)?;
    let bodies = string_column(batch, TableSchema::BODY)?;
    let metadata = string_column(batch, TableSchema::METADATA)?;
    let vectors = column(batch, TableSchema::VECTOR)?
        .as_fixed_size_list_opt()
        .ok_or_else(|| mismatch(format!("column {} is not a vector column", TableSchema::VECTOR)))?;

    let mut rows = Vec::with_capacity(batch.num_rows());
    for index in 0..ids.len() {
        if !ids.is_valid(index) {
            continue;
        }
        let vector = if vectors.is_valid(index) {
            vectors
                .value(index)
                .as_primitive_opt::<Float32Type>()
                .map(|values| values.values().to_vec())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        let metadata = if metadata.is_valid(index) {
            serde_json::from_str(metadata.value(index)).unwrap_or_else(|error| {
                tracing::warn!(row_id = ids.value(index), %error, "undecodable metadata, dropping it");
                BTreeMap::new()
            })
        } else {
            BTreeMap::new()
        };
        rows.push(StoredRow {
            row_id: ids.value(index).to_string(),
            vector,
            body_blob: if bodies.is_valid(index) {
                bodies.value(index).to_string()
            } else {
                String::new()
            },
            metadata,
        });
    }
    Ok(rows)
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// A LanceDB session. Every call opens table handles on demand; nothing is
/// cached across calls, so tables dropped or recreated elsewhere are seen.
pub struct LanceStore {
    connection: lancedb::Connection,
    dimension: usize,
}

impl LanceStore {
    pub fn new(connection: lancedb::Connection, dimension: usize) -> Self {
        Self {
            connection,
            dimension,
        }
    }

    async fn open(&self, table: &str) -> StoreResult<lancedb::Table> {
        self.connection
            .open_table(table)
            .execute()
            .await
            .map_err(store_error)
    }

    async fn collect(
        query: impl ExecutableQuery,
    ) -> StoreResult<Vec<RecordBatch>> {
        query
            .execute()
            .await
            .map_err(store_error)?
            .try_collect()
            .await
            .map_err(store_error)
    }
}

async fn add_rows(table: &lancedb::Table, rows: &[StoredRow], dimension: usize) -> StoreResult<()> {
    let batch = record_batch(rows, dimension).map_err(|error| match error {
        StoreError::SchemaMismatch { detail, .. } => StoreError::SchemaMismatch {
            table: table.name().to_string(),
            detail,
        },
        other => other,
    })?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], Arc::new(arrow_schema(dimension)));
    table
        .add(Box::new(batches))
        .execute()
        .await
        .map_err(store_error)?;
    Ok(())
}

#[async_trait]
impl VectorStore for LanceStore {
    async fn list_tables(&self) -> StoreResult<Vec<String>> {
        self.connection
            .table_names()
            .execute()
            .await
            .map_err(store_error)
    }

    async fn create_table(&self, table: &str, schema: TableSchema) -> StoreResult<()> {
        if self.table_exists(table).await? {
            return Err(StoreError::TableExists(table.to_string()));
        }
        self.connection
            .create_empty_table(table, Arc::new(arrow_schema(schema.dimension)))
            .execute()
            .await
            .map_err(store_error)?;
        tracing::debug!(table, dimension = schema.dimension, "table created");
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> StoreResult<()> {
        if !self.table_exists(table).await? {
            return Ok(());
        }
        self.connection
            .drop_table(table, &[])
            .await
            .map_err(store_error)?;
        tracing::debug!(table, "table dropped");
        Ok(())
    }

    async fn describe_table(&self, table: &str) -> StoreResult<TableDescription> {
        let schema = self.open(table).await?.schema().await.map_err(store_error)?;
        let dimension = schema
            .field_with_name(TableSchema::VECTOR)
            .ok()
            .and_then(|field| match field.data_type() {
                DataType::FixedSizeList(_, size) => usize::try_from(*size).ok(),
                _ => None,
            });
        Ok(TableDescription {
            columns: schema.fields().iter().map(|field| field.name().clone()).collect(),
            dimension,
        })
    }

    async fn count_rows(&self, table: &str) -> StoreResult<usize> {
        self.open(table)
            .await?
            .count_rows(None)
            .await
            .map_err(store_error)
    }

    async fn insert_rows(&self, table: &str, rows: &[StoredRow]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let handle = self.open(table).await?;
        add_rows(&handle, rows, self.dimension).await
    }

    async fn delete_rows(&self, table: &str, row_ids: &[String]) -> StoreResult<()> {
        if row_ids.is_empty() {
            return Ok(());
        }
        let predicate = format!(
            "{} IN ({})",
            TableSchema::ROW_ID,
            row_ids.iter().map(|id| quote(id)).collect::<Vec<_>>().join(", ")
        );
        self.open(table)
            .await?
            .delete(&predicate)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn truncate(&self, table: &str) -> StoreResult<()> {
        self.open(table)
            .await?
            .delete("true")
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn optimize(&self, table: &str) -> StoreResult<()> {
        let stats = self
            .open(table)
            .await?
            .optimize(OptimizeAction::All)
            .await
            .map_err(store_error)?;
        tracing::debug!(
            table,
            compacted = stats.compaction.is_some(),
            pruned = stats.prune.is_some(),
            "table optimized"
        );
        Ok(())
    }

    async fn list_row_ids(&self, table: &str) -> StoreResult<Vec<String>> {
        let handle = self.open(table).await?;
        let batches = Self::collect(
            handle
                .query()
                .select(lancedb::query::Select::columns(&[TableSchema::ROW_ID])),
        )
        .await?;

        let mut ids = Vec::new();
        for batch in &batches {
            let values = string_column(batch, TableSchema::ROW_ID)?;
            for index in 0..values.len() {
                if values.is_valid(index) {
                    ids.push(values.value(index).to_string());
                }
            }
        }
        Ok(ids)
    }

    async fn fetch_row(&self, table: &str, row_id: &str) -> StoreResult<Option<StoredRow>> {
        let handle = self.open(table).await?;
        let batches = Self::collect(
            handle
                .query()
                .only_if(format!("{} = {}", TableSchema::ROW_ID, quote(row_id)))
                .limit(1),
        )
        .await?;

        for batch in &batches {
            if let Some(row) = rows_from_batch(batch)?.into_iter().next() {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    async fn sample_rows(&self, table: &str, limit: usize) -> StoreResult<Vec<StoredRow>> {
        let handle = self.open(table).await?;
        let batches = Self::collect(handle.query().limit(limit)).await?;

        let mut rows = Vec::new();
        for batch in &batches {
            rows.extend(rows_from_batch(batch)?);
        }
        rows.truncate(limit);
        Ok(rows)
    }

    async fn nearest(
        &self,
        table: &str,
        vector: &[f32],
        limit: usize,
    ) -> StoreResult<Vec<SearchHit>> {
        let handle = self.open(table).await?;
        let query = handle
            .query()
            .nearest_to(vector)
            .map_err(store_error)?
            .limit(limit);
        let batches = Self::collect(query).await?;

        let mut hits = Vec::new();
        for batch in &batches {
            let ids = string_column(batch, TableSchema::ROW_ID)?;
            let bodies = string_column(batch, TableSchema::BODY)?;
            let distances = column(batch, "_distance")?
                .as_primitive_opt::<Float32Type>()
                .ok_or_else(|| mismatch("_distance is not a float column".to_string()))?;

            for index in 0..ids.len() {
                if ids.is_valid(index) && distances.is_valid(index) {
                    hits.push(SearchHit {
                        row_id: ids.value(index).to_string(),
                        body_blob: bodies.value(index).to_string(),
                        distance: distances.value(index),
                    });
                }
            }
        }
        Ok(hits)
    }

    async fn prepare_insert(&self, table: &str) -> StoreResult<Box<dyn PreparedInsert>> {
        Ok(Box::new(LanceInsert {
            table: self.open(table).await?,
            dimension: self.dimension,
        }))
    }

    async fn close(&self) -> StoreResult<()> {
        // Connection resources are released when the last handle drops.
        Ok(())
    }
}

/// Single-row insert bound to an open table handle.
struct LanceInsert {
    table: lancedb::Table,
    dimension: usize,
}

#[async_trait]
impl PreparedInsert for LanceInsert {
    async fn execute(&self, row: &StoredRow) -> StoreResult<()> {
        add_rows(&self.table, std::slice::from_ref(row), self.dimension).await
    }
}

/// Opens LanceDB sessions against a local path or object-store URI.
pub struct LanceConnector {
    uri: String,
    storage_options: BTreeMap<String, String>,
    dimension: usize,
}

impl LanceConnector {
    pub fn new(uri: impl Into<String>, storage_options: BTreeMap<String, String>, dimension: usize) -> Self {
        Self {
            uri: uri.into(),
            storage_options,
            dimension,
        }
    }
}

#[async_trait]
impl Connector for LanceConnector {
    async fn connect(&self) -> StoreResult<Arc<dyn VectorStore>> {
        let connection = lancedb::connect(&self.uri)
            .storage_options(self.storage_options.clone())
            .execute()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        // Opening is lazy for object stores; probe before handing the session out.
        if let Err(error) = connection.table_names().execute().await {
            drop(connection);
            return Err(StoreError::Connection(error.to_string()));
        }

        Ok(Arc::new(LanceStore::new(connection, self.dimension)))
    }

    fn endpoint(&self) -> String {
        self.uri.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIM: usize = 8;

    async fn store(dir: &tempfile::TempDir) -> Arc<dyn VectorStore> {
        let connector = LanceConnector::new(
            dir.path().to_str().expect("path utf8"),
            BTreeMap::new(),
            DIM,
        );
        connector.connect().await.expect("connect lancedb")
    }

    fn row(id: &str, seed: f32) -> StoredRow {
        StoredRow {
            row_id: id.to_string(),
            vector: vec![seed; DIM],
            body_blob: format!("body of {id}"),
            metadata: BTreeMap::from([("source".to_string(), "docs/it's.md".to_string())]),
        }
    }

    #[tokio::test]
    async fn rows_survive_a_write_and_read() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp).await;

        store
            .create_table("docs", TableSchema::new(DIM))
            .await
            .expect("create table");
        store
            .insert_rows("docs", &[row("a", 0.1), row("b", 0.9)])
            .await
            .expect("insert rows");

        assert_eq!(store.count_rows("docs").await.expect("count"), 2);
        let fetched = store
            .fetch_row("docs", "a")
            .await
            .expect("fetch")
            .expect("row a exists");
        assert_eq!(fetched, row("a", 0.1));

        let mut ids = store.list_row_ids("docs").await.expect("ids");
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        let description = store.describe_table("docs").await.expect("describe");
        assert_eq!(description.dimension, Some(DIM));
        assert!(description.missing_fields().is_empty());
    }

    #[tokio::test]
    async fn prepared_insert_and_truncate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp).await;
        store
            .create_table("docs", TableSchema::new(DIM))
            .await
            .expect("create table");

        let insert = store.prepare_insert("docs").await.expect("prepare");
        for index in 0..3 {
            insert
                .execute(&row(&format!("r{index}"), index as f32))
                .await
                .expect("insert row");
        }
        assert_eq!(store.count_rows("docs").await.expect("count"), 3);

        store.optimize("docs").await.expect("optimize");
        assert_eq!(store.count_rows("docs").await.expect("count"), 3);

        store
            .delete_rows("docs", &["r0".to_string()])
            .await
            .expect("delete");
        assert_eq!(store.count_rows("docs").await.expect("count"), 2);

        store.truncate("docs").await.expect("truncate");
        assert_eq!(store.count_rows("docs").await.expect("count"), 0);
        assert!(store.table_exists("docs").await.expect("exists"));
    }

    #[tokio::test]
    async fn nearest_returns_closest_row_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp).await;
        store
            .create_table("docs", TableSchema::new(DIM))
            .await
            .expect("create table");
        store
            .insert_rows("docs", &[row("far", 5.0), row("near", 1.0)])
            .await
            .expect("insert rows");

        let hits = store
            .nearest("docs", &vec![1.0; DIM], 2)
            .await
            .expect("search");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].row_id, "near");
    }

    #[tokio::test]
    async fn create_refuses_existing_table_and_drop_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp).await;
        store
            .create_table("docs", TableSchema::new(DIM))
            .await
            .expect("create table");

        let error = store
            .create_table("docs", TableSchema::new(DIM))
            .await
            .expect_err("duplicate create");
        assert!(matches!(error, StoreError::TableExists(_)));

        store.drop_table("docs").await.expect("drop");
        store.drop_table("docs").await.expect("drop again");
        assert!(matches!(
            store.count_rows("docs").await,
            Err(StoreError::MissingTable(_))
        ));
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp).await;
        store
            .create_table("docs", TableSchema::new(DIM))
            .await
            .expect("create table");

        let mut bad = row("bad", 1.0);
        bad.vector.pop();
        let error = store
            .insert_rows("docs", &[bad])
            .await
            .expect_err("dimension mismatch");
        assert!(matches!(error, StoreError::SchemaMismatch { table, .. } if table == "docs"));
    }
}
