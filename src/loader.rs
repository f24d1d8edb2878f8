//! Embedding batch loader: embeds validated records and writes them to the
//! staging table, shrinking batches when the provider hits a size limit.
//!
//! Only ever writes to staging. On any failure the staging table is dropped
//! before the result is returned.

use crate::config::{LoadConfig, MIN_BATCH_FLOOR};
use crate::embedding::EmbeddingProvider;
use crate::error::{EmbeddingError, Error, Result};
use crate::models::{LoadResult, Record};
use crate::retry::RetryPolicy;
use crate::store::{StoredRow, TableSchema, VectorStore};

pub struct EmbeddingBatchLoader<'a> {
    store: &'a dyn VectorStore,
    provider: &'a dyn EmbeddingProvider,
    config: &'a LoadConfig,
}

impl<'a> EmbeddingBatchLoader<'a> {
    pub fn new(
        store: &'a dyn VectorStore,
        provider: &'a dyn EmbeddingProvider,
        config: &'a LoadConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    fn floor(&self) -> usize {
        self.config.min_batch_size.max(MIN_BATCH_FLOOR)
    }

    /// Create `staging`, fill it with `records` and verify the row count.
    pub async fn load_to_staging(
        &self,
        records: &[Record],
        staging: &str,
        schema: TableSchema,
    ) -> LoadResult {
        if let Err(error) = self.store.create_table(staging, schema).await {
            tracing::error!(table = staging, %error, "failed to create staging table");
            return LoadResult::failure("failed to create staging table", error);
        }
        tracing::info!(table = staging, records = records.len(), "staging table created");

        match self.stage(records, staging).await {
            Ok(rows) => LoadResult::success(format!("staged {rows} rows in {staging}"), rows),
            Err(error) => {
                tracing::error!(table = staging, %error, "staging load failed");
                let result = LoadResult::failure("failed to load records into staging", error);
                match self.store.drop_table(staging).await {
                    Ok(()) => result,
                    Err(drop_error) => {
                        tracing::warn!(table = staging, error = %drop_error, "failed to drop staging table");
                        result.with_leftover_staging(staging, drop_error)
                    }
                }
            }
        }
    }

    async fn stage(&self, records: &[Record], staging: &str) -> Result<usize> {
        let floor = self.floor();
        let mut batch_size = self.config.embedding_batch_size.max(floor);
        let retry = RetryPolicy::fixed(
            self.config.max_batch_retries.saturating_add(1),
            self.config.batch_retry_delay(),
        );
        let mut state = retry.first();
        let mut offset = 0;

        while offset < records.len() {
            let end = (offset + batch_size).min(records.len());
            let batch = &records[offset..end];

            match self.write_batch(staging, batch).await {
                Ok(()) => {
                    offset = end;
                    state = retry.first();
                    tracing::debug!(
                        table = staging,
                        done = offset,
                        total = records.len(),
                        batch_size,
                        "batch staged"
                    );
                }
                Err(Error::Embedding(EmbeddingError::Limit(detail))) => {
                    let attempted = batch.len();
                    if attempted <= floor {
                        return Err(EmbeddingError::Limit(format!(
                            "{detail} (batch size already at the floor of {floor})"
                        ))
                        .into());
                    }
                    let shrunk = (attempted / 2).max(floor);
                    tracing::warn!(
                        from = attempted,
                        to = shrunk,
                        offset,
                        "provider limit hit, shrinking batch"
                    );
                    batch_size = shrunk;
                }
                Err(error) if error.is_retriable() => {
                    let Some(next) = retry.next(state) else {
                        return Err(error);
                    };
                    tracing::warn!(
                        offset,
                        attempt = state.attempt,
                        max_attempts = retry.max_attempts,
                        %error,
                        "batch failed, retrying"
                    );
                    if matches!(error, Error::Store(_)) {
                        // The write may have committed before it timed out.
                        let ids: Vec<String> = batch.iter().map(|record| record.id.clone()).collect();
                        self.store.delete_rows(staging, &ids).await?;
                    }
                    tokio::time::sleep(state.delay).await;
                    state = next;
                }
                Err(error) => return Err(error),
            }
        }

        let actual = self.store.count_rows(staging).await?;
        if actual != records.len() {
            return Err(Error::Verification {
                table: staging.to_string(),
                expected: records.len(),
                actual,
            });
        }

        tracing::info!(table = staging, rows = actual, "staging verified");
        Ok(actual)
    }

    async fn write_batch(&self, staging: &str, batch: &[Record]) -> Result<()> {
        let texts: Vec<String> = batch.iter().map(|record| record.text.clone()).collect();
        let vectors = self.provider.embed(&texts).await?;
        crate::embedding::check_batch(&vectors, batch.len(), self.provider.dimension())?;

        let rows: Vec<StoredRow> = batch
            .iter()
            .zip(vectors)
            .map(|(record, vector)| StoredRow {
                row_id: record.id.clone(),
                vector,
                body_blob: record.text.clone(),
                metadata: record.metadata.clone(),
            })
            .collect();

        self.store.insert_rows(staging, &rows).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::ScriptedEmbedder;
    use crate::store::{MemoryStore, StoreOp};
    use crate::store::memory::{FaultKind, FaultTarget};
    use std::collections::{BTreeMap, BTreeSet};

    const DIM: usize = 8;
    const STAGING: &str = "docs_staging_20240101_000000";

    fn records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| Record::new(format!("record number {i} with text"), BTreeMap::new()))
            .collect()
    }

    fn config() -> LoadConfig {
        LoadConfig {
            embedding_batch_size: 100,
            max_batch_retries: 2,
            batch_retry_delay_secs: 0.5,
            ..LoadConfig::default()
        }
    }

    async fn load(
        store: &MemoryStore,
        provider: &ScriptedEmbedder,
        config: &LoadConfig,
        records: &[Record],
    ) -> LoadResult {
        EmbeddingBatchLoader::new(store, provider, config)
            .load_to_staging(records, STAGING, TableSchema::new(DIM))
            .await
    }

    fn staged_ids(store: &MemoryStore) -> Vec<String> {
        store.rows(STAGING).into_iter().map(|row| row.row_id).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn limit_errors_halve_the_batch_without_losing_records() {
        let store = MemoryStore::new();
        let provider = ScriptedEmbedder::new(DIM).with_max_batch(25);
        let input = records(100);

        let result = load(&store, &provider, &config(), &input).await;

        assert!(result.is_success(), "{result:?}");
        assert_eq!(result.rows_processed, 100);
        assert_eq!(provider.calls(), vec![100, 50, 25, 25, 25, 25]);

        let ids = staged_ids(&store);
        assert_eq!(ids.len(), 100);
        let unique: BTreeSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 100);
        let expected: BTreeSet<_> = input.iter().map(|record| &record.id).collect();
        assert_eq!(unique, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_on_a_short_tail_halves_the_tail() {
        let store = MemoryStore::new();
        let provider = ScriptedEmbedder::new(DIM)
            .then_pass()
            .then_fail(EmbeddingError::Limit("max_tokens_per_request".into()));

        let result = load(&store, &provider, &config(), &records(130)).await;

        assert!(result.is_success(), "{result:?}");
        assert_eq!(provider.calls(), vec![100, 30, 15, 15]);
        assert_eq!(store.row_count(STAGING), Some(130));
    }

    #[tokio::test(start_paused = true)]
    async fn limit_at_the_floor_is_fatal() {
        let store = MemoryStore::new();
        let provider = ScriptedEmbedder::new(DIM).with_max_batch(5);
        let config = LoadConfig {
            embedding_batch_size: 20,
            ..config()
        };

        let result = load(&store, &provider, &config, &records(30)).await;

        assert!(!result.is_success());
        assert_eq!(provider.calls(), vec![20, 10]);
        assert!(result.errors[0].contains("floor"));
        assert_eq!(store.row_count(STAGING), None);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_provider_errors_are_retried() {
        let store = MemoryStore::new();
        let provider = ScriptedEmbedder::new(DIM)
            .then_fail(EmbeddingError::Transient("429".into()))
            .then_fail(EmbeddingError::Transient("503".into()));

        let result = load(&store, &provider, &config(), &records(40)).await;

        assert!(result.is_success(), "{result:?}");
        assert_eq!(provider.calls(), vec![40, 40, 40]);
        assert_eq!(store.row_count(STAGING), Some(40));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_and_drop_staging() {
        let store = MemoryStore::new();
        let provider = ScriptedEmbedder::new(DIM)
            .then_fail(EmbeddingError::Transient("429".into()))
            .then_fail(EmbeddingError::Transient("429".into()))
            .then_fail(EmbeddingError::Transient("429".into()));

        let result = load(&store, &provider, &config(), &records(40)).await;

        assert!(!result.is_success());
        assert_eq!(provider.calls().len(), 3);
        assert_eq!(store.row_count(STAGING), None);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_provider_error_is_not_retried() {
        let store = MemoryStore::new();
        let provider =
            ScriptedEmbedder::new(DIM).then_fail(EmbeddingError::Fatal("invalid api key".into()));

        let result = load(&store, &provider, &config(), &records(10)).await;

        assert!(!result.is_success());
        assert_eq!(provider.calls(), vec![10]);
        assert!(store.table_names().is_empty());
        assert!(result.warnings.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_staging_drop_is_reported() {
        let store = MemoryStore::new();
        store.inject(FaultTarget::DropTable, STAGING, 0, 1, FaultKind::Timeout);
        let provider =
            ScriptedEmbedder::new(DIM).then_fail(EmbeddingError::Fatal("invalid api key".into()));

        let result = load(&store, &provider, &config(), &records(10)).await;

        assert!(!result.is_success());
        assert_eq!(store.row_count(STAGING), Some(0));
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains(STAGING));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_insert_is_retried_without_duplicates() {
        let store = MemoryStore::new();
        store.inject(FaultTarget::InsertRows, STAGING, 1, 1, FaultKind::TimeoutAfterApply);
        let provider = ScriptedEmbedder::new(DIM);
        let config = LoadConfig {
            embedding_batch_size: 10,
            ..config()
        };

        let result = load(&store, &provider, &config, &records(30)).await;

        assert!(result.is_success(), "{result:?}");
        assert_eq!(store.row_count(STAGING), Some(30));
        assert_eq!(provider.calls(), vec![10, 10, 10, 10]);
        let unique: BTreeSet<_> = staged_ids(&store).into_iter().collect();
        assert_eq!(unique.len(), 30);
        assert!(store.journal().contains(&StoreOp::DeleteRows {
            table: STAGING.into(),
            rows: 10,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn count_mismatch_drops_staging_and_fails() {
        let store = MemoryStore::new();
        store.seed("docs", DIM, 5);
        store.inject(FaultTarget::InsertRows, STAGING, 0, 1, FaultKind::LoseOneRow);
        let provider = ScriptedEmbedder::new(DIM);

        let result = load(&store, &provider, &config(), &records(20)).await;

        assert!(!result.is_success());
        assert!(result.errors[0].contains("expected 20 rows, found 19"));
        assert_eq!(store.row_count(STAGING), None);
        assert_eq!(store.row_count("docs"), Some(5));
    }
}
