use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use index_reload::health::{HealthReport, HealthStatus};
use index_reload::maintenance::{ReconcileReport, TableInspection};
use index_reload::models::{LoadResult, ValidationResult};
use index_reload::RunReport;
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(
    name = "index-reload",
    version,
    about = "Validate, embed and safely reload the semantic-search index"
)]
pub struct Cli {
    /// TOML configuration file. Defaults to ./index-reload.toml when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load a corpus into the target table.
    Load(LoadArgs),
    /// Run read-only checks against the target table.
    HealthCheck,
    /// Validate a corpus without connecting to the store.
    Validate(ValidateArgs),
    /// Show a table's schema, row count and sample rows.
    Inspect(InspectArgs),
    /// Write a table's rows to CSV.
    Export(ExportArgs),
    /// Replace the target's contents with a backup table.
    Restore(RestoreArgs),
    /// List leftover staging and backup tables.
    Reconcile(ReconcileArgs),
}

#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// Replace the target's contents instead of appending.
    #[arg(long, default_value_t = false)]
    pub replace: bool,

    #[arg(long, default_value_t = false)]
    pub skip_health_check: bool,

    /// Corpus CSV. Defaults to the newest feed file in the input directory.
    #[arg(long)]
    pub input: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    #[arg(long)]
    pub input: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct InspectArgs {
    /// Table to inspect. Defaults to the target table.
    #[arg(long)]
    pub table: Option<String>,

    #[arg(long, default_value_t = 5)]
    pub limit: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    #[arg(long)]
    pub table: Option<String>,

    #[arg(long)]
    pub output: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct RestoreArgs {
    /// Backup table to restore from.
    #[arg(long)]
    pub backup: String,
}

#[derive(Args, Debug, Clone)]
pub struct ReconcileArgs {
    /// Drop orphaned staging tables. Backups are never dropped.
    #[arg(long, default_value_t = false)]
    pub drop_staging: bool,
}

pub fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T) -> String) {
    if json {
        match serde_json::to_string_pretty(value) {
            Ok(rendered) => println!("{rendered}"),
            Err(error) => tracing::error!(%error, "failed to render JSON output"),
        }
    } else {
        println!("{}", human(value));
    }
}

pub fn render_validation(result: &ValidationResult) -> String {
    let mut out = format!(
        "validation: {} ({} of {} rows usable)",
        if result.is_valid { "passed" } else { "failed" },
        result.valid_rows,
        result.total_rows
    );
    for error in &result.errors {
        out.push_str(&format!("\n  error: {error}"));
    }
    for warning in &result.warnings {
        out.push_str(&format!("\n  warning: {warning}"));
    }
    out
}

pub fn render_load(result: &LoadResult) -> String {
    let mut out = format!(
        "load: {} - {} ({} rows)",
        if result.is_success() { "success" } else { "failure" },
        result.message,
        result.rows_processed
    );
    if let Some(backup) = &result.backup_table {
        out.push_str(&format!("\n  backup table: {backup}"));
    }
    for error in &result.errors {
        out.push_str(&format!("\n  error: {error}"));
    }
    for warning in &result.warnings {
        out.push_str(&format!("\n  warning: {warning}"));
    }
    out
}

pub fn render_health(report: &HealthReport) -> String {
    let overall = match report.overall {
        HealthStatus::Healthy => "healthy",
        HealthStatus::Unhealthy => "unhealthy",
        HealthStatus::Failed => "failed",
    };
    let mut out = format!("health of {}: {overall}", report.table);
    if let Some(rows) = report.row_count {
        out.push_str(&format!("\n  rows: {rows}"));
    }
    for (name, check) in &report.checks {
        let mark = if check.passed { "ok" } else { "FAILED" };
        out.push_str(&format!("\n  [{mark}] {name}: {}", check.detail));
    }
    for warning in &report.warnings {
        out.push_str(&format!("\n  warning: {warning}"));
    }
    out
}

pub fn render_run(report: &RunReport) -> String {
    let mut sections = vec![
        format!("input: {}", report.input.display()),
        render_validation(&report.validation),
    ];
    if let Some(load) = &report.load {
        sections.push(render_load(load));
    }
    if let Some(health) = &report.health {
        sections.push(render_health(health));
    }
    sections.join("\n")
}

pub fn render_inspection(inspection: &TableInspection) -> String {
    let mut out = format!(
        "table: {}\n  columns: {}\n  dimension: {}\n  rows: {}",
        inspection.table,
        inspection.columns.join(", "),
        inspection
            .dimension
            .map(|dimension| dimension.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        inspection.row_count
    );
    for sample in &inspection.samples {
        out.push_str(&format!(
            "\n  - {} [{} dims] {}",
            sample.row_id, sample.dimension, sample.preview
        ));
        if !sample.metadata.is_empty() {
            out.push_str(&format!(" {:?}", sample.metadata));
        }
    }
    out
}

pub fn render_reconcile(report: &ReconcileReport) -> String {
    let list = |names: &[String]| {
        if names.is_empty() {
            "none".to_string()
        } else {
            names.join(", ")
        }
    };
    format!(
        "staging tables: {}\nbackup tables: {}\ndropped: {}",
        list(&report.staging),
        list(&report.backups),
        list(&report.dropped)
    )
}
