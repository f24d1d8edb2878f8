//! Records, table roles and the result types a run produces.

use crate::error::ValidationError;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One embeddable unit of the corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique within a table. Fresh per run.
    pub id: String,
    pub text: String,
    /// Empty until the embedding provider has produced it.
    pub vector: Vec<f32>,
    pub metadata: BTreeMap<String, String>,
}

impl Record {
    pub fn new(text: impl Into<String>, metadata: BTreeMap<String, String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            text: text.into(),
            vector: Vec::new(),
            metadata,
        }
    }
}

/// Outcome of corpus validation. Produced once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub valid_rows: usize,
    pub total_rows: usize,
}

impl ValidationResult {
    /// `Err` with every blocking problem when the corpus cannot be loaded.
    pub fn ensure_valid(&self) -> Result<(), ValidationError> {
        if self.is_valid {
            Ok(())
        } else {
            Err(ValidationError::Rejected(self.errors.clone()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// Terminal artifact of a load. Callers branch only on this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    pub outcome: Outcome,
    pub message: String,
    pub rows_processed: usize,
    /// Set whenever a backup table was created, including on failure.
    pub backup_table: Option<String>,
    pub errors: Vec<String>,
    /// Problems that did not fail the load but left something behind.
    pub warnings: Vec<String>,
}

impl LoadResult {
    pub fn success(message: impl Into<String>, rows_processed: usize) -> Self {
        Self {
            outcome: Outcome::Success,
            message: message.into(),
            rows_processed,
            backup_table: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self {
            outcome: Outcome::Failure,
            message: message.into(),
            rows_processed: 0,
            backup_table: None,
            errors: vec![error.to_string()],
            warnings: Vec::new(),
        }
    }

    pub fn with_backup(mut self, backup_table: Option<String>) -> Self {
        self.backup_table = backup_table;
        self
    }

    /// Note that `staging` could not be dropped and outlives the run.
    pub fn with_leftover_staging(mut self, staging: &str, error: impl std::fmt::Display) -> Self {
        self.warnings.push(format!(
            "staging table {staging} could not be dropped ({error}); remove it with `reconcile --drop-staging`"
        ));
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// The role a table plays within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableRole {
    Target,
    Staging,
    Backup,
}

impl TableRole {
    fn suffix(&self) -> Option<&'static str> {
        match self {
            TableRole::Target => None,
            TableRole::Staging => Some("staging"),
            TableRole::Backup => Some("backup"),
        }
    }
}

/// Names of the tables a run touches, derived from the target and run start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub target: String,
    pub staging: String,
    pub backup: String,
}

impl TableNames {
    pub fn new(target: &str, started_at: DateTime<Local>) -> Self {
        let stamp = started_at.format("%Y%m%d_%H%M%S").to_string();
        Self {
            target: target.to_string(),
            staging: role_table_name(target, TableRole::Staging, &stamp),
            backup: role_table_name(target, TableRole::Backup, &stamp),
        }
    }
}

fn role_table_name(target: &str, role: TableRole, stamp: &str) -> String {
    match role.suffix() {
        Some(suffix) => format!("{target}_{suffix}_{stamp}"),
        None => target.to_string(),
    }
}

/// Classify an existing table name relative to `target`.
pub fn table_role(target: &str, name: &str) -> Option<TableRole> {
    if name == target {
        return Some(TableRole::Target);
    }
    let rest = name.strip_prefix(target)?.strip_prefix('_')?;
    [TableRole::Staging, TableRole::Backup]
        .into_iter()
        .find(|role| {
            role.suffix()
                .and_then(|suffix| rest.strip_prefix(suffix))
                .and_then(|stamp| stamp.strip_prefix('_'))
                .is_some_and(is_timestamp)
        })
}

fn is_timestamp(stamp: &str) -> bool {
    chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn table_names_follow_the_naming_convention() {
        let started = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let names = TableNames::new("doc_snippets", started);
        assert_eq!(names.staging, "doc_snippets_staging_20240309_140507");
        assert_eq!(names.backup, "doc_snippets_backup_20240309_140507");
    }

    #[test]
    fn table_roles_are_recognised() {
        assert_eq!(table_role("docs", "docs"), Some(TableRole::Target));
        assert_eq!(
            table_role("docs", "docs_staging_20240309_140507"),
            Some(TableRole::Staging)
        );
        assert_eq!(
            table_role("docs", "docs_backup_20240309_140507"),
            Some(TableRole::Backup)
        );
        assert_eq!(table_role("docs", "docs_backup_latest"), None);
        assert_eq!(table_role("docs", "other_staging_20240309_140507"), None);
    }

    #[test]
    fn leftover_staging_is_reported_as_a_warning() {
        let result = LoadResult::success("loaded 3 rows into docs", 3)
            .with_leftover_staging("docs_staging_20240309_140507", "timed out");
        assert!(result.is_success());
        assert!(result.errors.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("docs_staging_20240309_140507"));
        assert!(result.warnings[0].contains("reconcile --drop-staging"));
    }

    #[test]
    fn rejected_corpus_carries_its_errors() {
        let result = ValidationResult {
            is_valid: false,
            errors: vec!["missing required column: text".into()],
            ..ValidationResult::default()
        };
        let error = result.ensure_valid().expect_err("invalid corpus");
        assert!(error.to_string().contains("missing required column: text"));

        let valid = ValidationResult {
            is_valid: true,
            ..ValidationResult::default()
        };
        assert!(valid.ensure_valid().is_ok());
    }

    #[test]
    fn record_ids_are_unique() {
        let a = Record::new("first chunk of text", BTreeMap::new());
        let b = Record::new("first chunk of text", BTreeMap::new());
        assert_ne!(a.id, b.id);
    }
}
