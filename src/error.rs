//! Error taxonomy for the reload engine.
//!
//! Every failure a run can hit maps onto one of these kinds. The kind decides
//! whether the failure is retried and whether `Target` may already have been
//! touched; callers outside the engine only ever see these through
//! `LoadResult.errors` and `HealthReport.errors`.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    /// Every connection attempt failed; carries the last cause.
    #[error("failed to connect after {attempts} attempt(s): {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// A row count did not match what the previous step guaranteed.
    #[error("verification failed for {table}: expected {expected} rows, found {actual}")]
    Verification {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether a bounded retry of the same operation may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Store(error) => error.is_transient(),
            Error::Embedding(error) => !matches!(error, EmbeddingError::Fatal(_)),
            Error::Connection { .. } => true,
            Error::Config(_) | Error::Validation(_) | Error::Verification { .. } => false,
            Error::Other(_) => false,
        }
    }

    /// Process exit code for a command that ended with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) | Error::Validation(_) => crate::engine::EXIT_INVALID,
            _ => crate::engine::EXIT_FAILURE,
        }
    }
}

/// Configuration and environment problems. Raised before any connection.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("no input file matching {prefix}*.csv in {}", directory.display())]
    NoInputFile { directory: PathBuf, prefix: String },
}

/// Corpus problems that block a load. Quality issues are warnings, not these.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("corpus validation failed: {}", .0.join("; "))]
    Rejected(Vec<String>),
}

/// Failures talking to the vector store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    /// Transient: the statement may have timed out before or after applying.
    #[error("store operation timed out: {0}")]
    Timeout(String),

    #[error("store query failed: {0}")]
    Query(String),

    #[error("table {0} does not exist")]
    MissingTable(String),

    #[error("table {0} already exists")]
    TableExists(String),

    #[error("schema mismatch on {table}: {detail}")]
    SchemaMismatch { table: String, detail: String },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Connection(_))
    }

    /// Classify a backend error message. Backends report timeouts only as text.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if lowered.contains("timeout") || lowered.contains("timed out") {
            StoreError::Timeout(message)
        } else {
            StoreError::Query(message)
        }
    }
}

/// Failures from the embedding provider.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    /// Request exceeded a token or payload limit; a smaller batch may succeed.
    #[error("embedding provider limit exceeded: {0}")]
    Limit(String),

    /// Rate limiting, timeouts, 5xx. The same request may succeed later.
    #[error("embedding provider temporarily unavailable: {0}")]
    Transient(String),

    #[error("embedding failed: {0}")]
    Fatal(String),
}
