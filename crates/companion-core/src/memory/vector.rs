//! ============================================================================
//! Vector Index - Nearest-neighbour search over companion knowledge chunks
//! ============================================================================
//! `PineconeIndex` talks to Pinecone's REST data plane; the Qdrant variant
//! lives in `qdrant`. Both filter on the `fileName` metadata field.
//! ============================================================================

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::types::{SimilarityMatch, VectorQuery, VectorRecord, FILE_NAME_FIELD};
use crate::error::{MemoryError, Result};

/// Pinecone control plane, used to resolve an index name to its host
pub const PINECONE_CONTROL_PLANE: &str = "https://api.pinecone.io";

/// REST API version header value
pub const PINECONE_API_VERSION: &str = "2024-07";

/// Vectors per upsert request
const UPSERT_BATCH: usize = 100;

/// Similarity search and ingestion against a vector database
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Nearest neighbours to `query.vector`, restricted to `query.file_name`
    async fn query(&self, query: &VectorQuery) -> Result<Vec<SimilarityMatch>>;

    /// Insert or replace records; returns how many were written
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<usize>;

    /// Backend name, for logs and health output
    fn backend_name(&self) -> &'static str;
}

/// Pinecone index accessed over REST
pub struct PineconeIndex {
    client: Client,
    api_key: String,
    index_name: String,
    host: OnceCell<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    vector: &'a [f32],
    top_k: u64,
    include_metadata: bool,
    include_values: bool,
    filter: Value,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<PineconeMatch>,
}

#[derive(Debug, Deserialize)]
struct PineconeMatch {
    #[allow(dead_code)]
    id: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
struct UpsertRequest<'a> {
    vectors: Vec<UpsertVector<'a>>,
}

#[derive(Debug, Serialize)]
struct UpsertVector<'a> {
    id: &'a str,
    values: &'a [f32],
    metadata: &'a Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertResponse {
    #[serde(default)]
    upserted_count: usize,
}

#[derive(Debug, Deserialize)]
struct DescribeIndexResponse {
    host: String,
}

impl PineconeIndex {
    /// Create a client for `index_name`; `host` skips the control-plane lookup
    pub fn new(api_key: &str, index_name: &str, host: Option<&str>) -> Self {
        let cell = OnceCell::new();
        if let Some(host) = host {
            // A fresh cell cannot already be set
            let _ = cell.set(normalize_host(host));
        }
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            index_name: index_name.to_string(),
            host: cell,
        }
    }

    /// Data-plane base URL, resolved once per process
    async fn host(&self) -> Result<&str> {
        let host = self
            .host
            .get_or_try_init(|| async {
                debug!("Resolving Pinecone host for index {}", self.index_name);
                let response = self
                    .client
                    .get(format!("{}/indexes/{}", PINECONE_CONTROL_PLANE, self.index_name))
                    .header("Api-Key", &self.api_key)
                    .header("X-Pinecone-API-Version", PINECONE_API_VERSION)
                    .send()
                    .await
                    .map_err(|e| vector_err("describe index", e))?;
                let described: DescribeIndexResponse = read_json(response, "describe index").await?;
                info!("Pinecone index {} served from {}", self.index_name, described.host);
                Ok::<String, MemoryError>(normalize_host(&described.host))
            })
            .await?;
        Ok(host.as_str())
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn query(&self, query: &VectorQuery) -> Result<Vec<SimilarityMatch>> {
        let host = self.host().await?;
        let request = QueryRequest {
            vector: &query.vector,
            top_k: query.top_k,
            include_metadata: true,
            include_values: false,
            filter: file_name_filter(&query.file_name),
        };

        let response = self
            .client
            .post(format!("{}/query", host))
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", PINECONE_API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| vector_err("query", e))?;

        let parsed: QueryResponse = read_json(response, "query").await?;
        Ok(parsed
            .matches
            .into_iter()
            .map(|m| SimilarityMatch {
                document: m.metadata.unwrap_or_default(),
                score: m.score,
            })
            .collect())
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<usize> {
        let host = self.host().await?;
        let mut written = 0;

        for batch in records.chunks(UPSERT_BATCH) {
            let request = UpsertRequest {
                vectors: batch
                    .iter()
                    .map(|r| UpsertVector {
                        id: &r.id,
                        values: &r.values,
                        metadata: &r.metadata,
                    })
                    .collect(),
            };

            let response = self
                .client
                .post(format!("{}/vectors/upsert", host))
                .header("Api-Key", &self.api_key)
                .header("X-Pinecone-API-Version", PINECONE_API_VERSION)
                .json(&request)
                .send()
                .await
                .map_err(|e| vector_err("upsert", e))?;

            let parsed: UpsertResponse = read_json(response, "upsert").await?;
            written += parsed.upserted_count;
        }

        debug!("Upserted {} vectors into {}", written, self.index_name);
        Ok(written)
    }

    fn backend_name(&self) -> &'static str {
        "pinecone"
    }
}

fn vector_err(action: &str, e: impl std::fmt::Display) -> MemoryError {
    MemoryError::VectorIndex(format!("Failed to {}: {}", action, e))
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    action: &str,
) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| vector_err(&format!("read {} response", action), e))?;
    if !status.is_success() {
        return Err(MemoryError::VectorIndex(format!(
            "{} failed ({}): {}",
            action, status, body
        )));
    }
    serde_json::from_str(&body).map_err(|e| vector_err(&format!("parse {} response", action), e))
}

fn file_name_filter(file_name: &str) -> Value {
    json!({ FILE_NAME_FIELD: { "$eq": file_name } })
}

fn normalize_host(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    }
}
