mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use index_reload::config::{Credentials, ReloadConfig, check_environment};
use index_reload::embedding::create_provider;
use index_reload::engine::{EXIT_FAILURE, EXIT_INVALID};
use index_reload::store::LanceConnector;
use index_reload::{LoadOptions, ReloadEngine, corpus};
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = ReloadConfig::load(cli.config.as_deref());
    let guard = init_tracing(
        config
            .as_ref()
            .ok()
            .and_then(|config| config.logging.directory.as_deref()),
    );

    let code = match config {
        Ok(config) => match run(cli, config).await {
            Ok(code) => code,
            Err(err) => {
                error!(error = %err, "command failed");
                for cause in err.chain().skip(1) {
                    error!(cause = %cause, "caused by");
                }
                err.downcast_ref::<index_reload::Error>()
                    .map_or(EXIT_FAILURE, index_reload::Error::exit_code)
            }
        },
        Err(err) => {
            error!(error = %err, "invalid configuration");
            EXIT_INVALID
        }
    };

    drop(guard);
    std::process::exit(code);
}

fn init_tracing(log_directory: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match log_directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "index-reload.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn resolve_input(explicit: Option<PathBuf>, config: &ReloadConfig) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => {
            let path = corpus::latest_input(&config.input.directory, &config.input.file_prefix)?;
            tracing::info!(input = %path.display(), "using latest feed file");
            Ok(path)
        }
    }
}

async fn run(cli: Cli, config: ReloadConfig) -> Result<i32> {
    let json = cli.json;

    if let Commands::Validate(args) = &cli.command {
        let input = match resolve_input(args.input.clone(), &config) {
            Ok(input) => input,
            Err(err) => {
                error!(error = %err, "no input file");
                return Ok(EXIT_INVALID);
            }
        };
        let (result, _) = corpus::validate(&input);
        cli::emit(json, &result, cli::render_validation);
        result.ensure_valid().map_err(index_reload::Error::from)?;
        return Ok(0);
    }

    let environment = check_environment(std::env::vars(), &config.embedding);
    if !environment.is_valid {
        cli::emit(json, &environment, cli::render_validation);
        return Ok(EXIT_INVALID);
    }

    let engine = match build_engine(config) {
        Ok(engine) => engine,
        Err(err) => {
            error!(error = %err, "failed to initialise");
            return Ok(EXIT_INVALID);
        }
    };

    match cli.command {
        Commands::Load(args) => {
            let input = match resolve_input(args.input, engine.config()) {
                Ok(input) => input,
                Err(err) => {
                    error!(error = %err, "no input file");
                    return Ok(EXIT_INVALID);
                }
            };
            let report = engine
                .load(LoadOptions {
                    input,
                    replace: args.replace,
                    skip_health_check: args.skip_health_check,
                })
                .await;
            cli::emit(json, &report, cli::render_run);
            Ok(report.exit_code())
        }
        Commands::HealthCheck => {
            let report = engine.health_check().await;
            cli::emit(json, &report, cli::render_health);
            Ok(report.exit_code())
        }
        Commands::Inspect(args) => {
            let inspection = engine
                .inspect(args.table.as_deref(), args.limit)
                .await
                .context("inspect failed")?;
            cli::emit(json, &inspection, cli::render_inspection);
            Ok(0)
        }
        Commands::Export(args) => {
            let rows = engine
                .export(args.table.as_deref(), &args.output)
                .await
                .context("export failed")?;
            let summary = serde_json::json!({ "rows": rows, "output": args.output });
            cli::emit(json, &summary, |_| {
                format!("exported {rows} rows to {}", args.output.display())
            });
            Ok(0)
        }
        Commands::Restore(args) => {
            let result = engine.restore(&args.backup).await;
            cli::emit(json, &result, cli::render_load);
            Ok(if result.is_success() { 0 } else { EXIT_FAILURE })
        }
        Commands::Reconcile(args) => {
            let report = engine
                .reconcile(args.drop_staging)
                .await
                .context("reconcile failed")?;
            cli::emit(json, &report, cli::render_reconcile);
            Ok(0)
        }
        Commands::Validate(_) => Ok(0),
    }
}

fn build_engine(config: ReloadConfig) -> Result<ReloadEngine> {
    let credentials = Credentials::from_env(&config.embedding)?;
    tracing::debug!(?credentials, "credentials loaded");

    let connector = LanceConnector::new(
        credentials.store_uri.clone(),
        credentials.store_options.clone(),
        config.embedding.dimension,
    );
    let provider = create_provider(&config.embedding, &credentials)?;

    Ok(ReloadEngine::new(config, Arc::new(connector), provider)?)
}
