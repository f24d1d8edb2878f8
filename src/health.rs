//! Read-only smoke tests against a live table.

use crate::config::HealthConfig;
use crate::embedding::EmbeddingProvider;
use crate::store::{TableSchema, VectorStore};
use serde::Serialize;
use std::collections::BTreeMap;

pub const CHECK_TABLE_EXISTS: &str = "table_exists";
pub const CHECK_ROW_COUNT: &str = "row_count";
pub const CHECK_SCHEMA: &str = "schema";
pub const CHECK_DIMENSION: &str = "vector_dimension";
pub const CHECK_SAMPLE: &str = "sample_rows";
pub const CHECK_SEARCH: &str = "similarity_search";

const SEARCH_LIMIT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// At least one check failed.
    Unhealthy,
    /// The table could not be examined at all.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub table: String,
    pub overall: HealthStatus,
    pub checks: BTreeMap<String, CheckOutcome>,
    pub row_count: Option<usize>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl HealthReport {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            overall: HealthStatus::Healthy,
            checks: BTreeMap::new(),
            row_count: None,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Report for a table that could not be reached at all.
    pub fn unreachable(table: &str, error: impl std::fmt::Display) -> Self {
        let mut report = Self::new(table);
        report.overall = HealthStatus::Failed;
        report.errors.push(error.to_string());
        report
    }

    pub fn is_healthy(&self) -> bool {
        self.overall == HealthStatus::Healthy
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_healthy() { 0 } else { 1 }
    }

    fn pass(&mut self, check: &str, detail: impl Into<String>) {
        self.checks.insert(
            check.to_string(),
            CheckOutcome {
                passed: true,
                detail: detail.into(),
            },
        );
    }

    fn fail(&mut self, check: &str, detail: impl Into<String>) {
        let detail = detail.into();
        self.errors.push(format!("{check}: {detail}"));
        self.checks.insert(
            check.to_string(),
            CheckOutcome {
                passed: false,
                detail,
            },
        );
        if self.overall == HealthStatus::Healthy {
            self.overall = HealthStatus::Unhealthy;
        }
    }
}

pub struct HealthChecker<'a> {
    store: &'a dyn VectorStore,
    provider: &'a dyn EmbeddingProvider,
    config: &'a HealthConfig,
    dimension: usize,
}

impl<'a> HealthChecker<'a> {
    pub fn new(
        store: &'a dyn VectorStore,
        provider: &'a dyn EmbeddingProvider,
        config: &'a HealthConfig,
        dimension: usize,
    ) -> Self {
        Self {
            store,
            provider,
            config,
            dimension,
        }
    }

    /// Run every check against `table`. Never mutates the store.
    pub async fn check(&self, table: &str) -> HealthReport {
        let mut report = HealthReport::new(table);

        match self.store.table_exists(table).await {
            Ok(true) => report.pass(CHECK_TABLE_EXISTS, "table exists"),
            Ok(false) => {
                report.fail(CHECK_TABLE_EXISTS, format!("table {table} does not exist"));
                report.overall = HealthStatus::Failed;
                return report;
            }
            Err(error) => {
                report.fail(CHECK_TABLE_EXISTS, error.to_string());
                report.overall = HealthStatus::Failed;
                return report;
            }
        }

        match self.store.count_rows(table).await {
            Ok(count) => {
                report.row_count = Some(count);
                if count == 0 {
                    report.warnings.push(format!("table {table} is empty"));
                }
                report.pass(CHECK_ROW_COUNT, format!("{count} rows"));
            }
            Err(error) => report.fail(CHECK_ROW_COUNT, error.to_string()),
        }

        self.check_schema(table, &mut report).await;
        self.check_sample(table, &mut report).await;
        self.check_search(table, &mut report).await;

        tracing::info!(
            table,
            overall = ?report.overall,
            rows = ?report.row_count,
            failed = report.errors.len(),
            "health check finished"
        );
        report
    }

    async fn check_schema(&self, table: &str, report: &mut HealthReport) {
        let description = match self.store.describe_table(table).await {
            Ok(description) => description,
            Err(error) => {
                report.fail(CHECK_SCHEMA, error.to_string());
                return;
            }
        };

        let missing = description.missing_fields();
        if missing.is_empty() {
            report.pass(CHECK_SCHEMA, "all required columns present");
        } else {
            report.fail(CHECK_SCHEMA, format!("missing columns: {}", missing.join(", ")));
        }

        match description.dimension {
            Some(dimension) if dimension == self.dimension => {
                report.pass(CHECK_DIMENSION, format!("{dimension} dimensions"))
            }
            Some(dimension) => report.fail(
                CHECK_DIMENSION,
                format!("table has {dimension} dimensions, expected {}", self.dimension),
            ),
            None => report.fail(
                CHECK_DIMENSION,
                format!("column {} is not a fixed-size vector", TableSchema::VECTOR),
            ),
        }
    }

    async fn check_sample(&self, table: &str, report: &mut HealthReport) {
        let rows = match self.store.sample_rows(table, self.config.sample_size).await {
            Ok(rows) => rows,
            Err(error) => {
                report.fail(CHECK_SAMPLE, error.to_string());
                return;
            }
        };
        if rows.is_empty() {
            report.pass(CHECK_SAMPLE, "no rows to sample");
            return;
        }

        let problems: Vec<String> = rows
            .iter()
            .filter_map(|row| {
                if row.row_id.is_empty() {
                    Some("row with empty row_id".to_string())
                } else if row.body_blob.trim().is_empty() {
                    Some(format!("row {} has empty body", row.row_id))
                } else if row.vector.len() != self.dimension {
                    Some(format!(
                        "row {} has {} dimensions, expected {}",
                        row.row_id,
                        row.vector.len(),
                        self.dimension
                    ))
                } else {
                    None
                }
            })
            .collect();

        if problems.is_empty() {
            report.pass(CHECK_SAMPLE, format!("{} sampled rows well-formed", rows.len()));
        } else {
            report.fail(CHECK_SAMPLE, problems.join("; "));
        }
    }

    async fn check_search(&self, table: &str, report: &mut HealthReport) {
        let query = vec![self.config.probe_query.clone()];
        let vector = match self.provider.embed(&query).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.swap_remove(0),
            Ok(_) => {
                report.fail(CHECK_SEARCH, "provider returned no embedding for the probe query");
                return;
            }
            Err(error) => {
                report.fail(CHECK_SEARCH, error.to_string());
                return;
            }
        };

        match self.store.nearest(table, &vector, SEARCH_LIMIT).await {
            Ok(hits) if !hits.is_empty() => {
                report.pass(CHECK_SEARCH, format!("{} results for probe query", hits.len()))
            }
            Ok(_) => report.fail(CHECK_SEARCH, "probe query returned no results"),
            Err(error) => report.fail(CHECK_SEARCH, error.to_string()),
        }
    }
}
