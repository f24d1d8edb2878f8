//! Deterministic provider for tests: records every requested batch size and
//! fails on cue.

use super::{EmbeddingProvider, EmbeddingResult};
use crate::error::EmbeddingError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Script {
    /// Outcomes for the next calls, consumed front first. `None` and an
    /// empty queue both mean succeed.
    queued: VecDeque<Option<EmbeddingError>>,
    /// Batches larger than this fail with a limit error.
    max_batch: Option<usize>,
    calls: Vec<usize>,
}

#[derive(Clone)]
pub struct ScriptedEmbedder {
    dimension: usize,
    script: Arc<Mutex<Script>>,
}

impl ScriptedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    /// Reject any batch larger than `max_batch` with a limit error.
    pub fn with_max_batch(self, max_batch: usize) -> Self {
        self.lock().max_batch = Some(max_batch);
        self
    }

    /// Fail the next unscripted call with `error`.
    pub fn then_fail(self, error: EmbeddingError) -> Self {
        self.lock().queued.push_back(Some(error));
        self
    }

    /// Let the next unscripted call through.
    pub fn then_pass(self) -> Self {
        self.lock().queued.push_back(None);
        self
    }

    /// Batch sizes of every call so far, including failed ones.
    pub fn calls(&self) -> Vec<usize> {
        self.lock().calls.clone()
    }

    /// The vector this provider returns for `text`.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let seed = text.bytes().fold(7u32, |acc, byte| acc.wrapping_mul(31).wrapping_add(byte as u32));
        (0..self.dimension)
            .map(|i| ((seed.wrapping_add(i as u32 * 13)) % 1000) as f32 / 1000.0)
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedEmbedder {
    async fn embed(&self, texts: &[String]) -> EmbeddingResult<Vec<Vec<f32>>> {
        {
            let mut script = self.lock();
            script.calls.push(texts.len());
            if let Some(Some(error)) = script.queued.pop_front() {
                return Err(error);
            }
            if script.max_batch.is_some_and(|max_batch| texts.len() > max_batch) {
                return Err(EmbeddingError::Limit(format!(
                    "max_tokens_per_request exceeded by batch of {}",
                    texts.len()
                )));
            }
        }
        Ok(texts.iter().map(|text| self.vector_for(text)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}
