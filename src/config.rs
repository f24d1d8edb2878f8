//! Configuration for the reload engine.
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file, then `INDEX_RELOAD__SECTION__KEY` environment overrides. Credentials
//! never come from files; see [`Credentials`].

use crate::error::ConfigError;
use crate::models::ValidationResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard floor for the adaptive batch size.
pub const MIN_BATCH_FLOOR: usize = 10;

/// Longest delay a single retry may sleep.
pub const MAX_RETRY_DELAY_SECS: f64 = 3600.0;

const ENV_PREFIX: &str = "INDEX_RELOAD";
const DEFAULT_CONFIG_FILE: &str = "index-reload.toml";

pub const STORE_URI_VAR: &str = "INDEX_RELOAD_STORE_URI";
pub const STORE_OPTION_PREFIX: &str = "INDEX_RELOAD_STORE_OPT_";
pub const OPENAI_KEY_VAR: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    pub store: StoreConfig,
    pub connection: ConnectionConfig,
    pub load: LoadConfig,
    pub embedding: EmbeddingConfig,
    pub health: HealthConfig,
    pub input: InputConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// The live, queried table.
    pub target_table: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            target_table: "doc_snippets".to_string(),
        }
    }
}

/// Retry policy for opening a store session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_connect_attempts: u32,
    pub retry_delay_secs: f64,
    pub retry_backoff_factor: f64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: 3,
            retry_delay_secs: 2.0,
            retry_backoff_factor: 2.0,
        }
    }
}

impl ConnectionConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs)
    }
}

/// Batching and retry knobs for staging and row copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Initial number of records per embedding request.
    pub embedding_batch_size: usize,
    /// Retries of one batch on transient provider or store errors.
    pub max_batch_retries: u32,
    pub batch_retry_delay_secs: f64,
    /// Lowest batch size adaptive shrinking may reach. Never below 10.
    pub min_batch_size: usize,
    /// Retries of a single row insert that timed out during a table copy.
    pub row_copy_retries: u32,
    pub row_retry_delay_secs: f64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            embedding_batch_size: 100,
            max_batch_retries: 3,
            batch_retry_delay_secs: 2.0,
            min_batch_size: MIN_BATCH_FLOOR,
            row_copy_retries: 1,
            row_retry_delay_secs: 1.0,
        }
    }
}

impl LoadConfig {
    pub fn batch_retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.batch_retry_delay_secs)
    }

    pub fn row_retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.row_retry_delay_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-compatible `/embeddings` HTTP endpoint.
    Openai,
    /// Local ONNX inference via fastembed.
    Fastembed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: ProviderKind,
    pub model: String,
    /// Vector dimensionality, fixed per deployment across all tables.
    pub dimension: usize,
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Model download cache for the local provider.
    pub cache_dir: Option<PathBuf>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Openai,
            model: "text-embedding-3-large".to_string(),
            dimension: 1536,
            base_url: "https://api.openai.com/v1".to_string(),
            request_timeout_secs: 60,
            cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_query: String,
    pub sample_size: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_query: "What is the latest release version?".to_string(),
            sample_size: 5,
        }
    }
}

/// Where to look for the corpus when no explicit path is given.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub directory: PathBuf,
    pub file_prefix: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("local_assets"),
            file_prefix: "vector_index_feed_".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// When set, logs are also written to a daily-rolling file here.
    pub directory: Option<PathBuf>,
}

impl ReloadConfig {
    /// Load configuration from defaults, an optional TOML file and the environment.
    ///
    /// An explicitly passed file must exist; the default `index-reload.toml`
    /// is only read when present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        let loaded: ReloadConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));

        if self.store.target_table.trim().is_empty() {
            return invalid("store.target_table must not be empty".into());
        }
        if !self
            .store
            .target_table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return invalid(format!(
                "store.target_table '{}' may only contain letters, digits and underscores",
                self.store.target_table
            ));
        }
        if self.connection.max_connect_attempts == 0 {
            return invalid("connection.max_connect_attempts must be at least 1".into());
        }
        if !self.connection.retry_backoff_factor.is_finite()
            || self.connection.retry_backoff_factor < 1.0
        {
            return invalid("connection.retry_backoff_factor must be a number >= 1.0".into());
        }
        for (name, secs) in [
            ("connection.retry_delay_secs", self.connection.retry_delay_secs),
            ("load.batch_retry_delay_secs", self.load.batch_retry_delay_secs),
            ("load.row_retry_delay_secs", self.load.row_retry_delay_secs),
        ] {
            if !secs.is_finite() || !(0.0..=MAX_RETRY_DELAY_SECS).contains(&secs) {
                return invalid(format!(
                    "{name} must be between 0 and {MAX_RETRY_DELAY_SECS} seconds, got {secs}"
                ));
            }
        }
        if self.load.min_batch_size < MIN_BATCH_FLOOR {
            return invalid(format!(
                "load.min_batch_size must be at least {MIN_BATCH_FLOOR}"
            ));
        }
        if self.load.embedding_batch_size < self.load.min_batch_size {
            return invalid(format!(
                "load.embedding_batch_size ({}) must be >= load.min_batch_size ({})",
                self.load.embedding_batch_size, self.load.min_batch_size
            ));
        }
        if self.embedding.dimension == 0 {
            return invalid("embedding.dimension must be positive".into());
        }
        if self.health.sample_size == 0 {
            return invalid("health.sample_size must be positive".into());
        }

        Ok(())
    }
}

/// Secrets and endpoints read from the environment.
#[derive(Clone)]
pub struct Credentials {
    pub store_uri: String,
    /// Forwarded verbatim to the store backend (object-store keys, regions).
    pub store_options: BTreeMap<String, String>,
    pub embedding_api_key: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("store_uri", &self.store_uri)
            .field("store_options", &self.store_options.keys().collect::<Vec<_>>())
            .field("embedding_api_key", &self.embedding_api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    pub fn from_env(embedding: &EmbeddingConfig) -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars(), embedding)
    }

    /// Build credentials from an explicit variable set. Fails on the first
    /// missing requirement; use [`check_environment`] to list all of them.
    pub fn from_vars(
        vars: impl IntoIterator<Item = (String, String)>,
        embedding: &EmbeddingConfig,
    ) -> Result<Self, ConfigError> {
        let mut store_uri = None;
        let mut embedding_api_key = None;
        let mut store_options = BTreeMap::new();

        for (key, value) in vars {
            if value.trim().is_empty() {
                continue;
            }
            if key == STORE_URI_VAR {
                store_uri = Some(value);
            } else if key == OPENAI_KEY_VAR {
                embedding_api_key = Some(value);
            } else if let Some(option) = key.strip_prefix(STORE_OPTION_PREFIX) {
                store_options.insert(option.to_lowercase(), value);
            }
        }

        let store_uri = store_uri.ok_or_else(|| ConfigError::MissingEnv(STORE_URI_VAR.into()))?;

        if is_remote_uri(&store_uri) && store_options.is_empty() {
            return Err(ConfigError::MissingEnv(format!(
                "{STORE_OPTION_PREFIX}* (credentials required for remote store {store_uri})"
            )));
        }

        if embedding.provider == ProviderKind::Openai && embedding_api_key.is_none() {
            return Err(ConfigError::MissingEnv(OPENAI_KEY_VAR.into()));
        }

        Ok(Self {
            store_uri,
            store_options,
            embedding_api_key,
        })
    }
}

fn is_remote_uri(uri: &str) -> bool {
    uri.contains("://") && !uri.starts_with("file://")
}

/// Report every missing credential at once, without connecting anywhere.
pub fn check_environment(
    vars: impl IntoIterator<Item = (String, String)>,
    embedding: &EmbeddingConfig,
) -> ValidationResult {
    let vars: BTreeMap<String, String> = vars
        .into_iter()
        .filter(|(_, value)| !value.trim().is_empty())
        .collect();
    let mut result = ValidationResult::default();

    match vars.get(STORE_URI_VAR) {
        None => result.errors.push(format!("{STORE_URI_VAR} environment variable not set")),
        Some(uri) if is_remote_uri(uri) => {
            if !vars.keys().any(|key| key.starts_with(STORE_OPTION_PREFIX)) {
                result.errors.push(format!(
                    "remote store {uri} requires credentials in {STORE_OPTION_PREFIX}* variables"
                ));
            }
        }
        Some(_) => {}
    }

    if embedding.provider == ProviderKind::Openai && !vars.contains_key(OPENAI_KEY_VAR) {
        result.errors.push(format!("{OPENAI_KEY_VAR} environment variable not set"));
    }

    result.is_valid = result.errors.is_empty();
    result
}
