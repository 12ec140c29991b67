//! ============================================================================
//! Memory Config - Explicit service configuration
//! ============================================================================
//! Every credential and endpoint the memory manager needs, gathered in one
//! struct. `from_env` reads the process environment (load `.env` first with
//! dotenvy); `from_lookup` takes any lookup function so tests stay hermetic.
//! ============================================================================

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MemoryError, Result};

/// Default number of history lines returned by `read_latest_history`
pub const DEFAULT_HISTORY_WINDOW: usize = 30;

/// Default number of nearest neighbours returned by `vector_search`
pub const DEFAULT_SEARCH_TOP_K: u64 = 3;

/// Default per-call deadline for upstream requests
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default Qdrant collection holding companion knowledge chunks
pub const DEFAULT_QDRANT_COLLECTION: &str = "companion_knowledge";

/// Where chat history lives
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryBackend {
    /// Upstash Redis REST endpoint
    Upstash { url: String, token: String },
    /// Embedded redb file
    Local { path: PathBuf },
}

/// Where knowledge-file vectors live
#[derive(Debug, Clone, PartialEq)]
pub enum VectorBackend {
    Pinecone {
        api_key: String,
        index_name: String,
        /// Data-plane host; resolved from the control plane when absent
        host: Option<String>,
    },
    Qdrant {
        url: String,
        api_key: Option<String>,
        collection: String,
    },
}

/// OpenAI-compatible embeddings endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Vector length the model returns; the Qdrant collection is created with it
    pub dimensions: usize,
}

/// Tunables that do not depend on which backends are in use
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySettings {
    pub history_window: usize,
    pub search_top_k: u64,
    pub request_timeout: Duration,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            history_window: DEFAULT_HISTORY_WINDOW,
            search_top_k: DEFAULT_SEARCH_TOP_K,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

/// Full configuration for `MemoryManager::from_config`
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryConfig {
    pub history: HistoryBackend,
    pub vectors: VectorBackend,
    pub embedding: EmbeddingConfig,
    pub settings: MemorySettings,
}

impl MemoryConfig {
    /// Build configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty values count as unset
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let history = match (get("UPSTASH_REDIS_REST_URL"), get("UPSTASH_REDIS_REST_TOKEN")) {
            (Some(url), Some(token)) => HistoryBackend::Upstash { url, token },
            (Some(_), None) => {
                return Err(MemoryError::Config(
                    "UPSTASH_REDIS_REST_URL is set but UPSTASH_REDIS_REST_TOKEN is missing".into(),
                ))
            }
            _ => HistoryBackend::Local {
                path: match get("COMPANION_HISTORY_PATH") {
                    Some(p) => PathBuf::from(p),
                    None => default_data_file("history.redb")?,
                },
            },
        };

        let vectors = if let (Some(api_key), Some(index_name)) =
            (get("PINECONE_API_KEY"), get("PINECONE_INDEX"))
        {
            VectorBackend::Pinecone {
                api_key,
                index_name,
                host: get("PINECONE_INDEX_HOST"),
            }
        } else if let Some(url) = get("QDRANT_URL") {
            VectorBackend::Qdrant {
                url,
                api_key: get("QDRANT_API_KEY"),
                collection: get("QDRANT_COLLECTION")
                    .unwrap_or_else(|| DEFAULT_QDRANT_COLLECTION.to_string()),
            }
        } else {
            return Err(MemoryError::Config(
                "No vector index configured (set PINECONE_API_KEY + PINECONE_INDEX or QDRANT_URL)"
                    .into(),
            ));
        };

        let api_key = get("OPENAI_API_KEY")
            .ok_or_else(|| MemoryError::Config("OPENAI_API_KEY is not set".into()))?;
        let model = get("EMBEDDING_MODEL")
            .unwrap_or_else(|| crate::memory::DEFAULT_EMBEDDING_MODEL.to_string());
        let dimensions = match get("EMBEDDING_DIMENSIONS") {
            Some(raw) => parse_positive("EMBEDDING_DIMENSIONS", &raw)? as usize,
            None => crate::memory::known_dimensions(&model).ok_or_else(|| {
                MemoryError::Config(format!(
                    "EMBEDDING_DIMENSIONS must be set for embedding model '{}'",
                    model
                ))
            })?,
        };
        let embedding = EmbeddingConfig {
            api_key,
            base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| crate::memory::OPENAI_BASE_URL.to_string()),
            model,
            dimensions,
        };

        let mut settings = MemorySettings::default();
        if let Some(raw) = get("COMPANION_REQUEST_TIMEOUT_SECS") {
            let secs = parse_positive("COMPANION_REQUEST_TIMEOUT_SECS", &raw)?;
            settings.request_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = get("COMPANION_HISTORY_WINDOW") {
            settings.history_window = parse_positive("COMPANION_HISTORY_WINDOW", &raw)? as usize;
        }

        Ok(Self {
            history,
            vectors,
            embedding,
            settings,
        })
    }
}

fn parse_positive(name: &str, raw: &str) -> Result<u64> {
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(MemoryError::Config(format!(
            "{} must be a positive integer, got '{}'",
            name, raw
        ))),
    }
}

/// Resolve `~/.companion/<file>`, creating the directory if needed
pub fn default_data_file(file: &str) -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| MemoryError::Config("Cannot determine home directory".into()))?;
    let dir = home.join(".companion");
    std::fs::create_dir_all(&dir)
        .map_err(|e| MemoryError::Config(format!("Failed to create .companion directory: {}", e)))?;
    Ok(dir.join(file))
}
