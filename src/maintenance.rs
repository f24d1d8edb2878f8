//! Operator tools: inspect, export, restore from backup, reconcile leftovers.

use crate::config::LoadConfig;
use crate::error::{ConfigError, Error, Result};
use crate::models::{LoadResult, TableRole, table_role};
use crate::promote::{compact, copy_rows};
use crate::store::{TableSchema, VectorStore};
use anyhow::Context as _;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, Serialize)]
pub struct SampleRow {
    pub row_id: String,
    pub preview: String,
    pub dimension: usize,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableInspection {
    pub table: String,
    pub columns: Vec<String>,
    pub dimension: Option<usize>,
    pub row_count: usize,
    pub samples: Vec<SampleRow>,
}

fn preview(text: &str) -> String {
    let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        preview.push_str("...");
    }
    preview
}

pub async fn inspect(store: &dyn VectorStore, table: &str, limit: usize) -> Result<TableInspection> {
    let description = store.describe_table(table).await?;
    let row_count = store.count_rows(table).await?;
    let samples = store
        .sample_rows(table, limit)
        .await?
        .into_iter()
        .map(|row| SampleRow {
            preview: preview(&row.body_blob),
            dimension: row.vector.len(),
            row_id: row.row_id,
            metadata: row.metadata,
        })
        .collect();

    Ok(TableInspection {
        table: table.to_string(),
        columns: description.columns,
        dimension: description.dimension,
        row_count,
        samples,
    })
}

/// Write every row of `table` to a CSV file. An empty table writes nothing.
pub async fn export(store: &dyn VectorStore, table: &str, path: &Path) -> Result<usize> {
    let count = store.count_rows(table).await?;
    if count == 0 {
        tracing::info!(table, "table is empty, nothing exported");
        return Ok(0);
    }

    let rows = store.sample_rows(table, count).await?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer
        .write_record([
            TableSchema::ROW_ID,
            TableSchema::BODY,
            TableSchema::METADATA,
            "vector_dimension",
        ])
        .context("failed to write CSV header")?;

    for row in &rows {
        let metadata = serde_json::to_string(&row.metadata).context("failed to encode metadata")?;
        writer
            .write_record([
                row.row_id.as_str(),
                row.body_blob.as_str(),
                metadata.as_str(),
                row.vector.len().to_string().as_str(),
            ])
            .context("failed to write CSV row")?;
    }
    writer.flush().context("failed to flush CSV export")?;

    tracing::info!(table, rows = rows.len(), path = %path.display(), "table exported");
    Ok(rows.len())
}

/// Replace the contents of `target` with the rows of `backup`. The backup
/// table is kept.
pub async fn restore(
    store: &dyn VectorStore,
    target: &str,
    backup: &str,
    schema: TableSchema,
    config: &LoadConfig,
) -> LoadResult {
    match restore_rows(store, target, backup, schema, config).await {
        Ok(rows) => {
            tracing::info!(target_table = target, backup, rows, "target restored from backup");
            LoadResult::success(format!("restored {rows} rows into {target} from {backup}"), rows)
                .with_backup(Some(backup.to_string()))
        }
        Err(error) => {
            tracing::error!(target_table = target, backup, %error, "restore failed");
            LoadResult::failure(format!("restore of {target} from {backup} failed"), error)
                .with_backup(Some(backup.to_string()))
        }
    }
}

async fn restore_rows(
    store: &dyn VectorStore,
    target: &str,
    backup: &str,
    schema: TableSchema,
    config: &LoadConfig,
) -> Result<usize> {
    if table_role(target, backup) != Some(TableRole::Backup) {
        return Err(ConfigError::Invalid(format!("{backup} is not a backup of {target}")).into());
    }

    let expected = store.count_rows(backup).await?;
    if expected == 0 {
        return Err(ConfigError::Invalid(format!("backup {backup} is empty")).into());
    }

    if store.table_exists(target).await? {
        store.truncate(target).await?;
    } else {
        store.create_table(target, schema).await?;
    }

    copy_rows(store, backup, target, config).await?;

    let actual = store.count_rows(target).await?;
    if actual != expected {
        return Err(Error::Verification {
            table: target.to_string(),
            expected,
            actual,
        });
    }
    compact(store, target).await;
    Ok(actual)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub staging: Vec<String>,
    pub backups: Vec<String>,
    pub dropped: Vec<String>,
}

/// List leftover staging and backup tables of `target`. Staging tables are
/// orphans of an interrupted run and may be dropped; backups are only listed.
pub async fn reconcile(
    store: &dyn VectorStore,
    target: &str,
    drop_staging: bool,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    for name in store.list_tables().await? {
        match table_role(target, &name) {
            Some(TableRole::Staging) => report.staging.push(name),
            Some(TableRole::Backup) => report.backups.push(name),
            _ => {}
        }
    }
    report.staging.sort();
    report.backups.sort();

    if drop_staging {
        for name in &report.staging {
            store.drop_table(name).await?;
            tracing::info!(table = %name, "dropped orphaned staging table");
            report.dropped.push(name.clone());
        }
    }

    Ok(report)
}
