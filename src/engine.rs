//! Run orchestration: validate, stage, promote, health-check.
//!
//! Every phase that talks to the store runs inside its own
//! [`with_connection`] scope. A later phase only starts after the previous
//! one verified its output.

use crate::config::ReloadConfig;
use crate::connection::{Connector, with_connection};
use crate::corpus;
use crate::embedding::EmbeddingProvider;
use crate::error::{ConfigError, Result};
use crate::health::{HealthChecker, HealthReport};
use crate::loader::EmbeddingBatchLoader;
use crate::maintenance::{self, ReconcileReport, TableInspection};
use crate::models::{LoadResult, TableNames, ValidationResult};
use crate::promote::Promoter;
use crate::retry::RetryPolicy;
use crate::store::TableSchema;
use futures::FutureExt as _;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Instrument as _;

/// Exit code for configuration and corpus validation errors.
pub const EXIT_INVALID: i32 = 2;
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub input: PathBuf,
    pub replace: bool,
    pub skip_health_check: bool,
}

/// Everything one `load` run produced. `load` is `None` when validation
/// rejected the corpus and no connection was opened.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub input: PathBuf,
    pub validation: ValidationResult,
    pub load: Option<LoadResult>,
    pub health: Option<HealthReport>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        if !self.validation.is_valid {
            return EXIT_INVALID;
        }
        match (&self.load, &self.health) {
            (Some(load), _) if !load.is_success() => EXIT_FAILURE,
            (None, _) => EXIT_FAILURE,
            (_, Some(health)) => health.exit_code(),
            _ => 0,
        }
    }
}

pub struct ReloadEngine {
    config: ReloadConfig,
    connector: Arc<dyn Connector>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl ReloadEngine {
    pub fn new(
        config: ReloadConfig,
        connector: Arc<dyn Connector>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> std::result::Result<Self, ConfigError> {
        if provider.dimension() != config.embedding.dimension {
            return Err(ConfigError::Invalid(format!(
                "provider {} produces {} dimensions, embedding.dimension is {}",
                provider.model_name(),
                provider.dimension(),
                config.embedding.dimension
            )));
        }
        Ok(Self {
            config,
            connector,
            provider,
        })
    }

    pub fn config(&self) -> &ReloadConfig {
        &self.config
    }

    fn schema(&self) -> TableSchema {
        TableSchema::new(self.config.embedding.dimension)
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config.connection)
    }

    fn target(&self) -> &str {
        &self.config.store.target_table
    }

    /// Validate the corpus, stage it, promote it and optionally health-check
    /// the result.
    pub async fn load(&self, options: LoadOptions) -> RunReport {
        let (validation, records) = corpus::validate(&options.input);
        let mut report = RunReport {
            input: options.input.clone(),
            validation,
            load: None,
            health: None,
        };
        if let Err(error) = report.validation.ensure_valid() {
            tracing::error!(%error, "nothing loaded");
            return report;
        }
        let Some(records) = records else {
            return report;
        };
        for warning in &report.validation.warnings {
            tracing::warn!(%warning, "corpus warning");
        }

        let replace = options.replace;
        let names = TableNames::new(self.target(), chrono::Local::now());
        let span = tracing::info_span!("load", target_table = %names.target, staging = %names.staging);

        let policy = self.policy();
        let phases = with_connection(self.connector.as_ref(), &policy, |store| {
            async move {
                let store = store.as_ref();
                let staged = EmbeddingBatchLoader::new(store, self.provider.as_ref(), &self.config.load)
                    .load_to_staging(&records, &names.staging, self.schema())
                    .await;
                if !staged.is_success() {
                    return Ok(staged);
                }

                Ok(Promoter::new(store, &names, self.schema(), &self.config.load)
                    .promote(staged.rows_processed, replace)
                    .await)
            }
            .instrument(span)
        });

        let load = match AssertUnwindSafe(phases).catch_unwind().await {
            Ok(Ok(load)) => load,
            Ok(Err(error)) => LoadResult::failure("could not connect to the vector store", error),
            Err(panic) => {
                let cause = panic_message(panic.as_ref());
                tracing::error!(%cause, "load aborted by a panic");
                LoadResult::failure(
                    "load aborted by a panic; run `reconcile` to list leftover tables",
                    cause,
                )
            }
        };

        let promoted = load.is_success();
        report.load = Some(load);

        if promoted && !options.skip_health_check {
            report.health = Some(self.health_check().await);
        }
        report
    }

    /// Health-check the target table in a session of its own.
    pub async fn health_check(&self) -> HealthReport {
        let target = self.target();
        let span = tracing::info_span!("health_check", target_table = %target);

        with_connection(self.connector.as_ref(), &self.policy(), |store| {
            async move {
                Ok(HealthChecker::new(
                    store.as_ref(),
                    self.provider.as_ref(),
                    &self.config.health,
                    self.config.embedding.dimension,
                )
                .check(target)
                .await)
            }
            .instrument(span)
        })
        .await
        .unwrap_or_else(|error| HealthReport::unreachable(target, error))
    }

    pub async fn inspect(&self, table: Option<&str>, limit: usize) -> Result<TableInspection> {
        let table = table.unwrap_or(self.target());
        with_connection(self.connector.as_ref(), &self.policy(), |store| async move {
            maintenance::inspect(store.as_ref(), table, limit).await
        })
        .await
    }

    pub async fn export(&self, table: Option<&str>, path: &Path) -> Result<usize> {
        let table = table.unwrap_or(self.target());
        with_connection(self.connector.as_ref(), &self.policy(), |store| async move {
            maintenance::export(store.as_ref(), table, path).await
        })
        .await
    }

    pub async fn restore(&self, backup: &str) -> LoadResult {
        let target = self.target();
        with_connection(self.connector.as_ref(), &self.policy(), |store| async move {
            Ok(maintenance::restore(store.as_ref(), target, backup, self.schema(), &self.config.load).await)
        })
        .await
        .unwrap_or_else(|error| {
            LoadResult::failure("could not connect to the vector store", error)
                .with_backup(Some(backup.to_string()))
        })
    }

    pub async fn reconcile(&self, drop_staging: bool) -> Result<ReconcileReport> {
        let target = self.target();
        with_connection(self.connector.as_ref(), &self.policy(), |store| async move {
            maintenance::reconcile(store.as_ref(), target, drop_staging).await
        })
        .await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::ScriptedEmbedder;
    use crate::health::HealthStatus;
    use crate::models::{TableRole, table_role};
    use crate::store::{MemoryConnector, MemoryStore};
    use std::io::Write as _;

    const DIM: usize = 8;

    struct Harness {
        store: MemoryStore,
        connector: Arc<MemoryConnector>,
        engine: ReloadEngine,
        dir: tempfile::TempDir,
    }

    fn harness(failing_connects: u32) -> Harness {
        let store = MemoryStore::new();
        let connector = Arc::new(MemoryConnector::new(store.clone()).fail_first(failing_connects));
        let mut config = ReloadConfig::default();
        config.store.target_table = "docs".into();
        config.embedding.dimension = DIM;
        let engine = ReloadEngine::new(config, connector.clone(), Arc::new(ScriptedEmbedder::new(DIM)))
            .expect("engine");
        Harness {
            store,
            connector,
            engine,
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    impl Harness {
        fn corpus(&self, header: &str, rows: usize) -> PathBuf {
            let path = self.dir.path().join("vector_index_feed_test.csv");
            let mut file = std::fs::File::create(&path).expect("create corpus");
            writeln!(file, "{header}").expect("write header");
            for index in 0..rows {
                writeln!(file, "documentation chunk number {index},docs/page{index}.md")
                    .expect("write row");
            }
            path
        }

        fn options(&self, input: PathBuf, replace: bool) -> LoadOptions {
            LoadOptions {
                input,
                replace,
                skip_health_check: false,
            }
        }

        fn tables_with_role(&self, role: TableRole) -> Vec<String> {
            self.store
                .table_names()
                .into_iter()
                .filter(|name| table_role("docs", name) == Some(role))
                .collect()
        }
    }

    #[tokio::test]
    async fn invalid_corpus_never_connects() {
        let h = harness(0);
        let input = h.corpus("body,source", 10);

        let report = h.engine.load(h.options(input, true)).await;

        assert!(!report.validation.is_valid);
        assert!(report.load.is_none());
        assert_eq!(h.connector.attempts(), 0);
        assert_eq!(report.exit_code(), EXIT_INVALID);
    }

    #[tokio::test]
    async fn fresh_load_into_empty_target() {
        let h = harness(0);
        let input = h.corpus("text,source", 100);

        let report = h.engine.load(h.options(input, true)).await;

        let load = report.load.as_ref().expect("load ran");
        assert!(load.is_success(), "{load:?}");
        assert_eq!(load.backup_table, None);
        assert_eq!(h.store.row_count("docs"), Some(100));
        assert!(h.tables_with_role(TableRole::Backup).is_empty());
        assert!(h.tables_with_role(TableRole::Staging).is_empty());
        assert_eq!(
            report.health.as_ref().map(|health| health.overall),
            Some(HealthStatus::Healthy)
        );
        assert_eq!(report.exit_code(), 0);
        assert_eq!(h.store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn replacing_load_over_existing_rows() {
        let h = harness(0);
        h.store.seed("docs", DIM, 50);
        let input = h.corpus("text,source", 100);

        let report = h.engine.load(h.options(input, true)).await;

        let load = report.load.as_ref().expect("load ran");
        assert!(load.is_success(), "{load:?}");
        let backup = load.backup_table.clone().expect("backup created");
        assert_eq!(h.store.row_count(&backup), Some(50));
        assert_eq!(h.store.row_count("docs"), Some(100));
        assert!(h.tables_with_role(TableRole::Staging).is_empty());
        assert!(h.store.rows("docs").iter().all(|row| row.metadata.contains_key("source")));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_store_fails_without_touching_anything() {
        let h = harness(3);
        let input = h.corpus("text,source", 20);

        let report = h.engine.load(h.options(input, true)).await;

        let load = report.load.as_ref().expect("load attempted");
        assert!(!load.is_success());
        assert_eq!(h.connector.attempts(), 3);
        assert!(h.store.table_names().is_empty());
        assert_eq!(report.exit_code(), EXIT_FAILURE);
    }

    #[tokio::test]
    async fn health_check_flags_wrong_dimension() {
        let h = harness(0);
        h.store.seed("docs", DIM * 2, 10);

        let health = h.engine.health_check().await;

        assert_eq!(health.overall, HealthStatus::Unhealthy);
        assert!(!health.checks[crate::health::CHECK_DIMENSION].passed);
        assert_ne!(health.exit_code(), 0);
    }

    struct PanickingEmbedder;

    #[async_trait::async_trait]
    impl EmbeddingProvider for PanickingEmbedder {
        async fn embed(&self, _texts: &[String]) -> crate::embedding::EmbeddingResult<Vec<Vec<f32>>> {
            panic!("tokenizer state corrupted");
        }

        fn dimension(&self) -> usize {
            DIM
        }

        fn model_name(&self) -> &str {
            "panicking"
        }
    }

    #[tokio::test]
    async fn panicking_phase_becomes_a_failed_load() {
        let h = harness(0);
        let mut config = ReloadConfig::default();
        config.store.target_table = "docs".into();
        config.embedding.dimension = DIM;
        let engine = ReloadEngine::new(config, h.connector.clone(), Arc::new(PanickingEmbedder))
            .expect("engine");
        let input = h.corpus("text,source", 10);

        let report = engine.load(h.options(input, true)).await;

        let load = report.load.as_ref().expect("load attempted");
        assert!(!load.is_success());
        assert!(load.message.contains("reconcile"));
        assert!(load.errors[0].contains("tokenizer state corrupted"));
        assert!(report.health.is_none());
        assert_eq!(report.exit_code(), EXIT_FAILURE);
        assert_eq!(h.store.open_sessions(), 0);
    }

    #[test]
    fn provider_dimension_must_match_config() {
        let store = MemoryStore::new();
        let config = ReloadConfig::default();
        let result = ReloadEngine::new(
            config,
            Arc::new(MemoryConnector::new(store)),
            Arc::new(ScriptedEmbedder::new(DIM)),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
