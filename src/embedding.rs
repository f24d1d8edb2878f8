//! Embedding providers.

pub mod local;
pub mod openai;
#[cfg(any(test, feature = "test-utils"))]
pub mod scripted;

use crate::config::{Credentials, EmbeddingConfig, ProviderKind};
use crate::error::{ConfigError, EmbeddingError};
use async_trait::async_trait;
use std::sync::Arc;

pub use local::LocalEmbedder;
pub use openai::OpenAiEmbedder;
#[cfg(any(test, feature = "test-utils"))]
pub use scripted::ScriptedEmbedder;

pub type EmbeddingResult<T> = std::result::Result<T, EmbeddingError>;

/// Turns text into fixed-dimension vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch. Returns one vector per input, in input order, or fails
    /// the whole batch.
    async fn embed(&self, texts: &[String]) -> EmbeddingResult<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Build the configured provider.
pub fn create_provider(
    config: &EmbeddingConfig,
    credentials: &Credentials,
) -> Result<Arc<dyn EmbeddingProvider>, ConfigError> {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider {
        ProviderKind::Openai => {
            let api_key = credentials
                .embedding_api_key
                .clone()
                .ok_or_else(|| ConfigError::MissingEnv(crate::config::OPENAI_KEY_VAR.into()))?;
            Arc::new(OpenAiEmbedder::new(config, api_key)?)
        }
        ProviderKind::Fastembed => Arc::new(LocalEmbedder::new(config)?),
    };

    tracing::info!(
        provider = ?config.provider,
        model = provider.model_name(),
        dimension = provider.dimension(),
        "embedding provider ready"
    );
    Ok(provider)
}

/// Check a provider response against the request before it reaches a table.
pub(crate) fn check_batch(
    vectors: &[Vec<f32>],
    expected_count: usize,
    dimension: usize,
) -> EmbeddingResult<()> {
    if vectors.len() != expected_count {
        return Err(EmbeddingError::Fatal(format!(
            "provider returned {} embeddings for {} inputs",
            vectors.len(),
            expected_count
        )));
    }
    if let Some(vector) = vectors.iter().find(|vector| vector.len() != dimension) {
        return Err(EmbeddingError::Fatal(format!(
            "provider returned a {}-dimensional vector, expected {}",
            vector.len(),
            dimension
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_or_misshapen_batches_are_fatal() {
        assert!(check_batch(&[vec![0.0; 4], vec![0.0; 4]], 2, 4).is_ok());
        assert!(matches!(
            check_batch(&[vec![0.0; 4]], 2, 4),
            Err(EmbeddingError::Fatal(_))
        ));
        assert!(matches!(
            check_batch(&[vec![0.0; 3]], 1, 4),
            Err(EmbeddingError::Fatal(_))
        ));
    }

    #[test]
    fn openai_provider_requires_a_key() {
        let credentials = Credentials {
            store_uri: "/tmp/index".into(),
            store_options: Default::default(),
            embedding_api_key: None,
        };
        let result = create_provider(&EmbeddingConfig::default(), &credentials);
        assert!(matches!(result, Err(ConfigError::MissingEnv(_))));
    }
}
