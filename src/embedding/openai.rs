//! OpenAI-compatible `/embeddings` HTTP provider.

use super::{EmbeddingProvider, EmbeddingResult, check_batch};
use crate::config::EmbeddingConfig;
use crate::error::{ConfigError, EmbeddingError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Body fragments providers use when a request is over a token or size limit.
const LIMIT_MARKERS: &[&str] = &[
    "max_tokens_per_request",
    "maximum context length",
    "too large",
    "too many tokens",
];

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    dimension: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            dimension: config.dimension,
        })
    }
}

/// Map a non-success response onto the error kinds the loader reacts to.
pub fn classify_response(status: StatusCode, body: &str) -> EmbeddingError {
    let lowered = body.to_lowercase();
    let detail = format!("{status}: {}", body.trim());

    if status == StatusCode::PAYLOAD_TOO_LARGE
        || LIMIT_MARKERS.iter().any(|marker| lowered.contains(marker))
    {
        EmbeddingError::Limit(detail)
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        EmbeddingError::Transient(detail)
    } else {
        EmbeddingError::Fatal(detail)
    }
}

fn classify_transport(error: reqwest::Error) -> EmbeddingError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        EmbeddingError::Transient(error.to_string())
    } else {
        EmbeddingError::Fatal(error.to_string())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> EmbeddingResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.dimension,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, &body));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Fatal(format!("invalid embeddings response: {e}")))?;

        parsed.data.sort_by_key(|data| data.index);
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|data| data.embedding).collect();
        check_batch(&vectors, texts.len(), self.dimension)?;

        tracing::debug!(batch = texts.len(), model = %self.model, "embedded batch");
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
