//! ============================================================================
//! Embedding Service - Vector embeddings for knowledge-file search
//! ============================================================================
//! Generates text embeddings through an OpenAI-compatible `/embeddings` API.
//! ============================================================================

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::error::{MemoryError, Result};

/// Default embedding model
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";

/// Expected embedding dimension for the default model
pub const EMBEDDING_DIM: usize = 1536;

/// Output size of the OpenAI embedding models, when `model` is one of them
pub fn known_dimensions(model: &str) -> Option<usize> {
    match model {
        "text-embedding-ada-002" | "text-embedding-3-small" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        _ => None,
    }
}

/// OpenAI API base URL
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Turns text into vectors
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single query string
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of documents, preserving input order
    async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    /// Model name, for logs
    fn model(&self) -> &str;
}

/// Embedding service backed by an OpenAI-compatible HTTP API
pub struct EmbeddingService {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    dimensions: usize,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    model: String,
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct EmbeddingUsage {
    prompt_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

impl EmbeddingService {
    /// Create a service against the public OpenAI API
    pub fn new_openai(api_key: String) -> Self {
        Self::new_custom(
            api_key,
            OPENAI_BASE_URL.to_string(),
            DEFAULT_EMBEDDING_MODEL.to_string(),
        )
    }

    /// Create with custom base URL and model
    pub fn new_custom(api_key: String, base_url: String, model: String) -> Self {
        let dimensions = known_dimensions(&model).unwrap_or(EMBEDDING_DIM);
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimensions,
        }
    }

    /// Override the vector length the model is expected to return
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self::new_custom(
            config.api_key.clone(),
            config.base_url.clone(),
            config.model.clone(),
        )
        .with_dimensions(config.dimensions)
    }

    /// Generate embeddings for multiple texts
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| MemoryError::Embedding(format!("Failed to send embedding request: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MemoryError::Embedding(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ErrorResponse>(&body) {
                return Err(MemoryError::Embedding(format!(
                    "API error ({}): {}",
                    status, error.error.message
                )));
            }
            return Err(MemoryError::Embedding(format!("API error ({}): {}", status, body)));
        }

        let parsed: EmbeddingResponse = serde_json::from_str(&body).map_err(|e| {
            MemoryError::Embedding(format!("Failed to parse embedding response: {}", e))
        })?;

        if let Some(usage) = &parsed.usage {
            debug!(
                "Embedding tokens used: {} (model: {})",
                usage.total_tokens, parsed.model
            );
        }

        let embeddings = order_by_index(parsed.data);
        if embeddings.len() != texts.len() {
            return Err(MemoryError::InvalidEmbedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        for embedding in &embeddings {
            validate_vector(embedding)?;
            check_dimensions(embedding, self.dimensions)?;
        }

        Ok(embeddings)
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[async_trait]
impl Embedder for EmbeddingService {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MemoryError::InvalidEmbedding("No embedding returned".into()))
    }

    async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        self.embed(&texts).await
    }

    fn model(&self) -> &str {
        &self.model
    }
}

fn order_by_index(data: Vec<EmbeddingData>) -> Vec<Vec<f32>> {
    let mut indexed: Vec<(usize, Vec<f32>)> =
        data.into_iter().map(|d| (d.index, d.embedding)).collect();
    indexed.sort_by_key(|(idx, _)| *idx);
    indexed.into_iter().map(|(_, e)| e).collect()
}

/// A usable embedding is non-empty and every component is finite
pub fn validate_vector(vector: &[f32]) -> Result<()> {
    if vector.is_empty() {
        return Err(MemoryError::InvalidEmbedding("empty vector".into()));
    }
    if let Some(pos) = vector.iter().position(|v| !v.is_finite()) {
        return Err(MemoryError::InvalidEmbedding(format!(
            "non-finite component at position {}",
            pos
        )));
    }
    Ok(())
}

/// Reject vectors whose length differs from what the index was built for
fn check_dimensions(vector: &[f32], expected: usize) -> Result<()> {
    if vector.len() != expected {
        return Err(MemoryError::InvalidEmbedding(format!(
            "expected {} dimensions, got {} (check EMBEDDING_DIMENSIONS)",
            expected,
            vector.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_creation() {
        let service = EmbeddingService::new_openai("test-key".to_string());
        assert_eq!(service.base_url(), OPENAI_BASE_URL);
        assert_eq!(service.model(), DEFAULT_EMBEDDING_MODEL);
    }

    #[test]
    fn test_custom_base_url_trims_slash() {
        let service = EmbeddingService::new_custom(
            "k".into(),
            "http://localhost:8080/v1/".into(),
            "nomic-embed-text".into(),
        );
        assert_eq!(service.base_url(), "http://localhost:8080/v1");
        assert_eq!(service.model(), "nomic-embed-text");

        let service = service.with_dimensions(768);
        assert_eq!(service.dimensions(), 768);
    }

    #[test]
    fn test_dimensions_follow_model() {
        assert_eq!(known_dimensions("text-embedding-3-large"), Some(3072));
        assert_eq!(known_dimensions(DEFAULT_EMBEDDING_MODEL), Some(EMBEDDING_DIM));
        assert_eq!(known_dimensions("nomic-embed-text"), None);

        let service = EmbeddingService::new_custom(
            "k".into(),
            OPENAI_BASE_URL.into(),
            "text-embedding-3-large".into(),
        );
        assert_eq!(service.dimensions(), 3072);
    }

    #[test]
    fn test_check_dimensions() {
        assert!(check_dimensions(&[0.1; 768], 768).is_ok());
        let err = check_dimensions(&[0.1; 3072], EMBEDDING_DIM).unwrap_err();
        assert!(matches!(err, MemoryError::InvalidEmbedding(_)));
        assert!(err.to_string().contains("expected 1536 dimensions, got 3072"));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let service = EmbeddingService::new_openai("test-key".to_string());
        let result = service.embed(&[]).await.unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_response_reordered_by_index() {
        let body = r#"{
            "data": [
                {"embedding": [0.2, 0.2], "index": 1},
                {"embedding": [0.1, 0.1], "index": 0}
            ],
            "model": "text-embedding-ada-002",
            "usage": {"prompt_tokens": 4, "total_tokens": 4}
        }"#;
        let parsed: EmbeddingResponse = serde_json::from_str(body).unwrap();
        let ordered = order_by_index(parsed.data);
        assert_eq!(ordered, vec![vec![0.1, 0.1], vec![0.2, 0.2]]);
    }

    #[test]
    fn test_validate_vector() {
        assert!(validate_vector(&[0.1, -0.3]).is_ok());
        assert!(matches!(
            validate_vector(&[]),
            Err(MemoryError::InvalidEmbedding(_))
        ));
        assert!(matches!(
            validate_vector(&[0.1, f32::NAN]),
            Err(MemoryError::InvalidEmbedding(_))
        ));
    }
}
