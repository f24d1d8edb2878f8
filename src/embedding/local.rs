//! Local embedding generation via fastembed.

use super::{EmbeddingProvider, EmbeddingResult, check_batch};
use crate::config::EmbeddingConfig;
use crate::error::{ConfigError, EmbeddingError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Output size of fastembed's default model (all-MiniLM-L6-v2).
pub const LOCAL_DIMENSION: usize = 384;

const MODEL_NAME: &str = "all-MiniLM-L6-v2";

const ONNX_THREADS: &str = "2";

/// fastembed's TextEmbedding is not Send across awaits, so it lives behind an
/// Arc and is only called from spawn_blocking.
pub struct LocalEmbedder {
    model: Arc<fastembed::TextEmbedding>,
}

impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ConfigError> {
        if config.dimension != LOCAL_DIMENSION {
            return Err(ConfigError::Invalid(format!(
                "fastembed produces {LOCAL_DIMENSION}-dimensional vectors, but embedding.dimension is {}",
                config.dimension
            )));
        }

        cap_onnx_threads();

        let cache_dir = config.cache_dir.clone().unwrap_or_else(default_cache_dir);
        let options = fastembed::InitOptions::default()
            .with_cache_dir(cache_dir)
            .with_show_download_progress(true);

        let model = fastembed::TextEmbedding::try_new(options)
            .map_err(|e| ConfigError::Invalid(format!("failed to load local embedding model: {e}")))?;

        Ok(Self {
            model: Arc::new(model),
        })
    }
}

/// Pin the ONNX intra-op pool to [`ONNX_THREADS`] unless `OMP_NUM_THREADS`
/// is already set.
fn cap_onnx_threads() {
    if std::env::var_os("OMP_NUM_THREADS").is_some() {
        return;
    }
    // SAFETY: runs while the provider is built at startup, before the model
    // exists and before any task reads the environment.
    unsafe { std::env::set_var("OMP_NUM_THREADS", ONNX_THREADS) };
    tracing::debug!(threads = ONNX_THREADS, "capped ONNX runtime threads");
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("index-reload")
        .join("fastembed")
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedder {
    async fn embed(&self, texts: &[String]) -> EmbeddingResult<Vec<Vec<f32>>> {
        let model = self.model.clone();
        let inputs = texts.to_vec();
        let vectors = tokio::task::spawn_blocking(move || model.embed(inputs, None))
            .await
            .map_err(|e| EmbeddingError::Fatal(format!("embedding task failed: {e}")))?
            .map_err(|e| EmbeddingError::Fatal(e.to_string()))?;

        check_batch(&vectors, texts.len(), LOCAL_DIMENSION)?;
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        LOCAL_DIMENSION
    }

    fn model_name(&self) -> &str {
        MODEL_NAME
    }
}
