//! ============================================================================
//! Memory Module - Conversational memory for companions
//! ============================================================================
//! Chat history lives in a sorted set per companion key; knowledge files are
//! chunked into a vector index and searched by the recent conversation.
//!
//! ## Architecture
//! ```text
//! CompanionKey ─► store key ─► HistoryStore (Upstash REST | redb)
//!
//! recent chat ─► Embedder ─► VectorIndex (Pinecone | Qdrant) ─► top 3 chunks
//!                               filter: fileName == companion file
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use companion_core::memory::{CompanionKey, MemoryManager};
//!
//! let manager = MemoryManager::global().await?;
//! let key = CompanionKey::new("Elon", "llama2", user_id);
//!
//! manager.seed_chat_history(&seed, "\n\n", &key).await?;
//! manager.write_to_history("Human: what's next?", &key).await?;
//! let recent = manager.read_latest_history(&key).await?;
//! let similar = manager.vector_search(&recent, "elon.txt").await.into_matches();
//! ```
//! ============================================================================

mod embeddings;
mod history;
mod history_local;
mod manager;
mod qdrant;
mod types;
mod vector;

// Re-export public types
pub use embeddings::{
    known_dimensions, validate_vector, Embedder, EmbeddingService, DEFAULT_EMBEDDING_MODEL,
    EMBEDDING_DIM, OPENAI_BASE_URL,
};
pub use history::{HistoryStore, UpstashHistoryStore};
pub use history_local::LocalHistoryStore;
pub use manager::{chunk_text, MemoryHealth, MemoryManager, DEFAULT_SEED_DELIMITER, MAX_CHUNK_CHARS};
pub use qdrant::QdrantIndex;
pub use types::{
    CompanionKey, HistoryEntry, SearchOutcome, SeedOutcome, SimilarityMatch, VectorQuery,
    VectorRecord, WriteOutcome, FILE_NAME_FIELD, KEY_SEPARATOR, TEXT_FIELD,
};
pub use vector::{PineconeIndex, VectorIndex, PINECONE_API_VERSION, PINECONE_CONTROL_PLANE};
