//! Backup and swap coordinator.
//!
//! Promotes a verified staging table into the target:
//!
//! ```text
//! CheckTarget -> Backup -> Truncate -> Copy -> Verify -> Cleanup -> Done
//!                                                                 \-> Failed
//! ```
//!
//! `Backup` and `Truncate` only run for a replacing load over a non-empty
//! target. Any failure before `Truncate` leaves the target untouched. A backup
//! table, once created, is never dropped here.

use crate::config::LoadConfig;
use crate::error::{Error, Result, StoreError};
use crate::models::{LoadResult, TableNames};
use crate::retry::RetryPolicy;
use crate::store::{TableSchema, VectorStore};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteState {
    CheckTarget,
    Backup,
    Truncate,
    Copy,
    Verify,
    Cleanup,
    Done,
    Failed,
}

impl fmt::Display for PromoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PromoteState::CheckTarget => "check-target",
            PromoteState::Backup => "backup",
            PromoteState::Truncate => "truncate",
            PromoteState::Copy => "copy",
            PromoteState::Verify => "verify",
            PromoteState::Cleanup => "cleanup",
            PromoteState::Done => "done",
            PromoteState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the state machine has done so far. Drives the failure report.
struct Progress {
    state: PromoteState,
    backup_table: Option<String>,
    target_modified: bool,
}

impl Progress {
    fn enter(&mut self, state: PromoteState) {
        tracing::debug!(from = %self.state, to = %state, "promote state change");
        self.state = state;
    }
}

pub struct Promoter<'a> {
    store: &'a dyn VectorStore,
    names: &'a TableNames,
    schema: TableSchema,
    config: &'a LoadConfig,
}

impl<'a> Promoter<'a> {
    pub fn new(
        store: &'a dyn VectorStore,
        names: &'a TableNames,
        schema: TableSchema,
        config: &'a LoadConfig,
    ) -> Self {
        Self {
            store,
            names,
            schema,
            config,
        }
    }

    /// Make the staged rows live. `staged_rows` is the count the loader
    /// verified in staging.
    ///
    /// Non-replacing loads append: running the same corpus twice leaves both
    /// copies in the target.
    pub async fn promote(&self, staged_rows: usize, replace: bool) -> LoadResult {
        let mut progress = Progress {
            state: PromoteState::CheckTarget,
            backup_table: None,
            target_modified: false,
        };

        let outcome = self.run(&mut progress, staged_rows, replace).await;
        let failed_in = progress.state;

        progress.enter(PromoteState::Cleanup);
        let leftover = self.store.drop_table(&self.names.staging).await.err();
        if let Some(error) = &leftover {
            tracing::warn!(table = %self.names.staging, %error, "failed to drop staging table");
        }

        let result = match outcome {
            Ok(rows) => {
                progress.enter(PromoteState::Done);
                tracing::info!(
                    table = %self.names.target,
                    rows,
                    backup = ?progress.backup_table,
                    "promotion complete"
                );
                LoadResult::success(
                    format!("loaded {staged_rows} rows into {}", self.names.target),
                    rows,
                )
                .with_backup(progress.backup_table)
            }
            Err(error) => {
                progress.enter(PromoteState::Failed);
                let message = match (&progress.backup_table, progress.target_modified) {
                    (Some(backup), true) => format!(
                        "promotion failed during {failed_in}; {} was modified, restore it from {backup}",
                        self.names.target
                    ),
                    (None, true) => format!(
                        "promotion failed during {failed_in}; {} may contain a partial load",
                        self.names.target
                    ),
                    (_, false) => format!(
                        "promotion failed during {failed_in}; {} is unchanged",
                        self.names.target
                    ),
                };
                tracing::error!(%error, backup = ?progress.backup_table, "{}", message);
                LoadResult::failure(message, error).with_backup(progress.backup_table)
            }
        };

        match leftover {
            Some(error) => result.with_leftover_staging(&self.names.staging, error),
            None => result,
        }
    }

    async fn run(&self, progress: &mut Progress, staged_rows: usize, replace: bool) -> Result<usize> {
        let target = self.names.target.as_str();

        let before = self.check_target().await?;
        let needs_backup = replace && before > 0;
        tracing::info!(table = target, rows = before, replace, needs_backup, "target checked");

        if needs_backup {
            progress.enter(PromoteState::Backup);
            let backup = self.names.backup.as_str();
            self.store.create_table(backup, self.schema).await?;
            progress.backup_table = Some(backup.to_string());

            let copied = copy_rows(self.store, target, backup, self.config).await?;
            let actual = self.store.count_rows(backup).await?;
            if actual != before {
                return Err(Error::Verification {
                    table: backup.to_string(),
                    expected: before,
                    actual,
                });
            }
            tracing::info!(backup, rows = copied, "backup verified");
            compact(self.store, backup).await;

            progress.enter(PromoteState::Truncate);
            progress.target_modified = true;
            self.store.truncate(target).await?;
            tracing::info!(table = target, "target truncated");
        }

        progress.enter(PromoteState::Copy);
        progress.target_modified = true;
        let copied = copy_rows(self.store, &self.names.staging, target, self.config).await?;

        progress.enter(PromoteState::Verify);
        let expected = if replace { staged_rows } else { before + staged_rows };
        let actual = self.store.count_rows(target).await?;
        if actual != expected {
            return Err(Error::Verification {
                table: target.to_string(),
                expected,
                actual,
            });
        }
        tracing::info!(table = target, rows = actual, copied, "target verified");
        compact(self.store, target).await;

        Ok(copied)
    }

    /// Row count of the target, creating it when missing. Fails if the live
    /// table's shape does not match the configured schema.
    async fn check_target(&self) -> Result<usize> {
        let target = self.names.target.as_str();

        if !self.store.table_exists(target).await? {
            tracing::info!(table = target, "target table missing, creating it");
            self.store.create_table(target, self.schema).await?;
            return Ok(0);
        }

        let description = self.store.describe_table(target).await?;
        let missing = description.missing_fields();
        if !missing.is_empty() {
            return Err(StoreError::SchemaMismatch {
                table: target.to_string(),
                detail: format!("missing columns: {}", missing.join(", ")),
            }
            .into());
        }
        if description.dimension != Some(self.schema.dimension) {
            return Err(StoreError::SchemaMismatch {
                table: target.to_string(),
                detail: format!(
                    "vector dimension is {:?}, expected {}",
                    description.dimension, self.schema.dimension
                ),
            }
            .into());
        }

        Ok(self.store.count_rows(target).await?)
    }
}

/// Compact `table` after a row-by-row copy, which leaves one table version
/// per inserted row. Failures are only logged.
pub async fn compact(store: &dyn VectorStore, table: &str) {
    match store.optimize(table).await {
        Ok(()) => tracing::debug!(table, "table compacted"),
        Err(error) => tracing::warn!(table, %error, "failed to compact table"),
    }
}

/// Copy every row of `source` into `destination`, one prepared insert per
/// row. A timed-out insert is retried after deleting whatever it may have
/// written.
pub async fn copy_rows(
    store: &dyn VectorStore,
    source: &str,
    destination: &str,
    config: &LoadConfig,
) -> Result<usize> {
    let ids = store.list_row_ids(source).await?;
    let insert = store.prepare_insert(destination).await?;
    let retry = RetryPolicy::fixed(
        config.row_copy_retries.saturating_add(1),
        config.row_retry_delay(),
    );

    let mut copied = 0;
    for id in &ids {
        let Some(row) = store.fetch_row(source, id).await? else {
            tracing::warn!(table = source, row_id = %id, "row disappeared during copy");
            continue;
        };

        let row = &row;
        let insert = &insert;
        retry
            .run(
                "copy row",
                |state| async move {
                    if state.attempt > 1 {
                        store
                            .delete_rows(destination, std::slice::from_ref(&row.row_id))
                            .await?;
                    }
                    insert.execute(row).await
                },
                StoreError::is_transient,
            )
            .await
            .map_err(|exhausted| exhausted.error)?;

        copied += 1;
        if copied % 1000 == 0 {
            tracing::info!(source, destination, copied, total = ids.len(), "copy progress");
        }
    }

    tracing::debug!(source, destination, copied, "copy finished");
    Ok(copied)
}
