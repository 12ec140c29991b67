//! ============================================================================
//! Memory Manager - Orchestrates chat history and knowledge search
//! ============================================================================
//! Composes the history store, vector index and embedder behind one handle.
//! Upstream failures come back as typed errors (or `SearchOutcome::Failed`);
//! a companion key without a user is logged and skipped.
//! ============================================================================

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use super::embeddings::{validate_vector, Embedder, EmbeddingService};
use super::history::{HistoryStore, UpstashHistoryStore};
use super::history_local::LocalHistoryStore;
use super::qdrant::QdrantIndex;
use super::types::{
    CompanionKey, HistoryEntry, SearchOutcome, SeedOutcome, SimilarityMatch, VectorQuery,
    VectorRecord, WriteOutcome, FILE_NAME_FIELD, TEXT_FIELD,
};
use super::vector::{PineconeIndex, VectorIndex};
use crate::config::{HistoryBackend, MemoryConfig, MemorySettings, VectorBackend};
use crate::error::{MemoryError, Result};

/// Delimiter used when seeding history with an empty delimiter
pub const DEFAULT_SEED_DELIMITER: &str = "\n";

/// Upper bound on knowledge chunk length, in characters
pub const MAX_CHUNK_CHARS: usize = 1000;

static GLOBAL: OnceCell<MemoryManager> = OnceCell::const_new();

/// Memory manager combining history, vector index and embeddings
pub struct MemoryManager {
    history: Arc<dyn HistoryStore>,
    vectors: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    settings: MemorySettings,
}

/// Which backends a manager is wired to
#[derive(Debug, Clone, Serialize)]
pub struct MemoryHealth {
    pub history_backend: &'static str,
    pub vector_backend: &'static str,
    pub embedding_model: String,
}

impl MemoryManager {
    /// Assemble a manager from already-built collaborators
    pub fn with_backends(
        history: Arc<dyn HistoryStore>,
        vectors: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        settings: MemorySettings,
    ) -> Self {
        Self {
            history,
            vectors,
            embedder,
            settings,
        }
    }

    /// Build every client named in `config`
    pub async fn from_config(config: MemoryConfig) -> Result<Self> {
        let history: Arc<dyn HistoryStore> = match &config.history {
            HistoryBackend::Upstash { url, token } => Arc::new(UpstashHistoryStore::new(url, token)),
            HistoryBackend::Local { path } => Arc::new(LocalHistoryStore::open(path)?),
        };

        let vectors: Arc<dyn VectorIndex> = match &config.vectors {
            VectorBackend::Pinecone {
                api_key,
                index_name,
                host,
            } => Arc::new(PineconeIndex::new(api_key, index_name, host.as_deref())),
            VectorBackend::Qdrant {
                url,
                api_key,
                collection,
            } => Arc::new(
                QdrantIndex::new(
                    url,
                    api_key.as_deref(),
                    collection,
                    config.embedding.dimensions,
                )
                .await?,
            ),
        };

        let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingService::from_config(&config.embedding));

        info!(
            "Memory manager ready (history: {}, vectors: {}, embeddings: {})",
            history.backend_name(),
            vectors.backend_name(),
            embedder.model()
        );

        Ok(Self::with_backends(history, vectors, embedder, config.settings))
    }

    /// Process-wide manager configured from the environment
    pub async fn global() -> Result<&'static MemoryManager> {
        Self::global_with(|| async { Self::from_config(MemoryConfig::from_env()?).await }).await
    }

    /// Process-wide manager built by `init` on first use.
    ///
    /// Concurrent first callers wait on the same initialization; `init` runs
    /// at most once unless it fails, in which case the next caller retries.
    pub async fn global_with<F, Fut>(init: F) -> Result<&'static MemoryManager>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MemoryManager>>,
    {
        GLOBAL.get_or_try_init(init).await
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    pub fn health(&self) -> MemoryHealth {
        MemoryHealth {
            history_backend: self.history.backend_name(),
            vector_backend: self.vectors.backend_name(),
            embedding_model: self.embedder.model().to_string(),
        }
    }

    /// Append one chat line, scored by the current time in milliseconds
    pub async fn write_to_history(
        &self,
        text: &str,
        companion_key: &CompanionKey,
    ) -> Result<WriteOutcome> {
        let key = match companion_key.store_key() {
            Ok(key) => key,
            Err(e) => {
                warn!("{}", e);
                return Ok(WriteOutcome::Skipped);
            }
        };

        let entry = HistoryEntry::new(now_millis(), text);
        let added = self
            .with_deadline("history write", self.history.add(&key, std::slice::from_ref(&entry)))
            .await?;

        debug!("Wrote history line for {}", key);
        Ok(WriteOutcome::Written { added })
    }

    /// The most recent `history_window` lines, oldest first, newline-joined
    pub async fn read_latest_history(&self, companion_key: &CompanionKey) -> Result<String> {
        let key = match companion_key.store_key() {
            Ok(key) => key,
            Err(e) => {
                warn!("{}", e);
                return Ok(String::new());
            }
        };

        let members = self
            .with_deadline(
                "history read",
                self.history.range_by_score(&key, 0.0, now_millis()),
            )
            .await?;

        debug!("Read {} history lines for {}", members.len(), key);
        Ok(latest_window(&members, self.settings.history_window))
    }

    /// First-time-only history initialization.
    ///
    /// Lines split on `delimiter` are stored with scores 0, 1, 2, ... in
    /// input order. A key that already has history is left untouched.
    pub async fn seed_chat_history(
        &self,
        seed_content: &str,
        delimiter: &str,
        companion_key: &CompanionKey,
    ) -> Result<SeedOutcome> {
        let key = match companion_key.store_key() {
            Ok(key) => key,
            Err(e) => {
                warn!("{}", e);
                return Ok(SeedOutcome::Skipped);
            }
        };

        if self
            .with_deadline("history exists", self.history.exists(&key))
            .await?
        {
            info!("User already has chat history ({})", key);
            return Ok(SeedOutcome::AlreadySeeded);
        }

        let delimiter = if delimiter.is_empty() {
            DEFAULT_SEED_DELIMITER
        } else {
            delimiter
        };
        let entries: Vec<HistoryEntry> = seed_content
            .split(delimiter)
            .enumerate()
            .map(|(i, line)| HistoryEntry::new(i as f64, line))
            .collect();

        self.with_deadline("history seed", self.history.add(&key, &entries))
            .await?;

        info!("Seeded {} history lines for {}", entries.len(), key);
        Ok(SeedOutcome::Seeded {
            lines: entries.len(),
        })
    }

    /// Knowledge chunks from `companion_file_name` most similar to the recent chat
    pub async fn vector_search(
        &self,
        recent_chat_history: &str,
        companion_file_name: &str,
    ) -> SearchOutcome {
        let vector = match self
            .with_deadline("embedding", self.embedder.embed_query(recent_chat_history))
            .await
            .and_then(|v| validate_vector(&v).map(|_| v))
        {
            Ok(vector) => vector,
            Err(e) => {
                error!("Failed to create valid embedding vector: {}", e);
                return SearchOutcome::Failed(e);
            }
        };

        let query = VectorQuery {
            vector,
            top_k: self.settings.search_top_k,
            file_name: companion_file_name.to_string(),
        };

        match self
            .with_deadline("vector query", self.vectors.query(&query))
            .await
        {
            Ok(matches) => {
                let matches = rank_matches(matches, companion_file_name, self.settings.search_top_k);
                debug!(
                    "Vector search found {} matches in {}",
                    matches.len(),
                    companion_file_name
                );
                if matches.is_empty() {
                    SearchOutcome::Empty
                } else {
                    SearchOutcome::Matches(matches)
                }
            }
            Err(e) => {
                warn!("Failed to get vector search results: {}", e);
                SearchOutcome::Failed(e)
            }
        }
    }

    /// Chunk, embed and upsert a companion knowledge file; returns chunks written
    pub async fn index_companion_file(&self, file_name: &str, content: &str) -> Result<usize> {
        let chunks = chunk_text(content, MAX_CHUNK_CHARS);
        if chunks.is_empty() {
            warn!("Knowledge file {} has no content to index", file_name);
            return Ok(0);
        }

        let embeddings = self
            .with_deadline("embedding", self.embedder.embed_documents(chunks.clone()))
            .await?;
        if embeddings.len() != chunks.len() {
            return Err(MemoryError::InvalidEmbedding(format!(
                "expected {} embeddings, got {}",
                chunks.len(),
                embeddings.len()
            )));
        }

        let mut records = Vec::with_capacity(chunks.len());
        for (i, (text, values)) in chunks.into_iter().zip(embeddings).enumerate() {
            validate_vector(&values)?;
            let mut metadata = Map::new();
            metadata.insert(FILE_NAME_FIELD.to_string(), json!(file_name));
            metadata.insert(TEXT_FIELD.to_string(), json!(text));
            metadata.insert("chunk".to_string(), json!(i));
            records.push(VectorRecord {
                id: format!("{}-{}", file_name, i),
                values,
                metadata,
            });
        }

        let written = self
            .with_deadline("vector upsert", self.vectors.upsert(records))
            .await?;
        info!("Indexed {} chunks from {}", written, file_name);
        Ok(written)
    }

    async fn with_deadline<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let timeout = self.settings.request_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(MemoryError::Timeout { operation, timeout }),
        }
    }
}

fn now_millis() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

fn latest_window(members: &[String], window: usize) -> String {
    let start = members.len().saturating_sub(window);
    members[start..].join("\n")
}

/// Keep matches for `file_name`, best first, at most `top_k`
fn rank_matches(
    mut matches: Vec<SimilarityMatch>,
    file_name: &str,
    top_k: u64,
) -> Vec<SimilarityMatch> {
    // Not every backend honours metadata filters on every plan
    matches.retain(|m| m.file_name() == Some(file_name));
    matches.sort_by(|a, b| b.score.total_cmp(&a.score));
    matches.truncate(top_k as usize);
    matches
}

/// Split text into paragraph-aligned chunks of at most `max_chars` characters
pub fn chunk_text(content: &str, max_chars: usize) -> Vec<String> {
    let content = content.replace("\r\n", "\n");
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for para in content.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let para_len = para.chars().count();

        if para_len > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = para.chars().collect();
            for piece in chars.chunks(max_chars) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }

        if !current.is_empty() && current_len + 2 + para_len > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(para);
        current_len += para_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeEmbedder {
        vector: Vec<f32>,
        delay: Option<Duration>,
    }

    impl FakeEmbedder {
        fn returning(vector: Vec<f32>) -> Self {
            Self {
                vector,
                delay: None,
            }
        }
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.vector.clone())
        }

        async fn embed_documents(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| self.vector.clone()).collect())
        }

        fn model(&self) -> &str {
            "fake-embedder"
        }
    }

    /// Returns its canned matches regardless of the filter
    #[derive(Default)]
    struct FakeIndex {
        matches: Vec<SimilarityMatch>,
        fail: bool,
        queries: Mutex<Vec<VectorQuery>>,
        upserted: Mutex<Vec<VectorRecord>>,
    }

    #[async_trait]
    impl VectorIndex for FakeIndex {
        async fn query(&self, query: &VectorQuery) -> Result<Vec<SimilarityMatch>> {
            self.queries.lock().unwrap().push(query.clone());
            if self.fail {
                return Err(MemoryError::VectorIndex("index unavailable".into()));
            }
            Ok(self.matches.clone())
        }

        async fn upsert(&self, records: Vec<VectorRecord>) -> Result<usize> {
            let count = records.len();
            self.upserted.lock().unwrap().extend(records);
            Ok(count)
        }

        fn backend_name(&self) -> &'static str {
            "fake"
        }
    }

    fn chunk(file_name: &str, text: &str, score: f32) -> SimilarityMatch {
        let mut document = Map::new();
        document.insert(FILE_NAME_FIELD.into(), json!(file_name));
        document.insert(TEXT_FIELD.into(), json!(text));
        SimilarityMatch { document, score }
    }

    fn manager_with(index: FakeIndex, embedder: FakeEmbedder) -> (MemoryManager, Arc<FakeIndex>) {
        let index = Arc::new(index);
        let manager = MemoryManager::with_backends(
            Arc::new(LocalHistoryStore::in_memory().unwrap()),
            index.clone(),
            Arc::new(embedder),
            MemorySettings::default(),
        );
        (manager, index)
    }

    fn manager() -> MemoryManager {
        manager_with(FakeIndex::default(), FakeEmbedder::returning(vec![0.1, 0.2])).0
    }

    /// Original ordering: last 30, reversed, reversed again
    fn double_reverse_window(members: &[String]) -> String {
        let start = members.len().saturating_sub(30);
        let mut result: Vec<String> = members[start..].to_vec();
        result.reverse();
        result.reverse();
        result.join("\n")
    }

    #[tokio::test]
    async fn test_write_then_read_returns_written_line_last() {
        let manager = manager();
        let key = CompanionKey::new("Ada", "gpt", "user_1");

        let outcome = manager.write_to_history("Hello Ada", &key).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written { added: 1 });

        let history = manager.read_latest_history(&key).await.unwrap();
        assert_eq!(history.lines().last(), Some("Hello Ada"));
    }

    #[tokio::test]
    async fn test_seed_preserves_order() {
        let manager = manager();
        let key = CompanionKey::new("Ada", "gpt", "user_1");

        let outcome = manager.seed_chat_history("a\nb\nc", "\n", &key).await.unwrap();
        assert_eq!(outcome, SeedOutcome::Seeded { lines: 3 });
        assert_eq!(manager.read_latest_history(&key).await.unwrap(), "a\nb\nc");

        let store_key = key.store_key().unwrap();
        let exact = manager.history.range_by_score(&store_key, 1.0, 1.0).await.unwrap();
        assert_eq!(exact, vec!["b"]);
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let manager = manager();
        let key = CompanionKey::new("Ada", "gpt", "user_1");

        manager.seed_chat_history("one\ntwo", "\n", &key).await.unwrap();
        let first = manager.read_latest_history(&key).await.unwrap();

        let outcome = manager
            .seed_chat_history("three\nfour", "\n", &key)
            .await
            .unwrap();
        assert_eq!(outcome, SeedOutcome::AlreadySeeded);
        assert_eq!(manager.read_latest_history(&key).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_seed_with_custom_and_empty_delimiter() {
        let manager = manager();
        let key = CompanionKey::new("Ada", "gpt", "user_1");
        manager
            .seed_chat_history("Human: hi|||Ada: hello", "|||", &key)
            .await
            .unwrap();
        assert_eq!(
            manager.read_latest_history(&key).await.unwrap(),
            "Human: hi\nAda: hello"
        );

        let other = CompanionKey::new("Ada", "gpt", "user_2");
        manager.seed_chat_history("x\ny", "", &other).await.unwrap();
        assert_eq!(manager.read_latest_history(&other).await.unwrap(), "x\ny");
    }

    #[tokio::test]
    async fn test_read_returns_latest_thirty_oldest_first() {
        let manager = manager();
        let key = CompanionKey::new("Ada", "gpt", "user_1");
        let lines: Vec<String> = (0..45).map(|i| format!("line {}", i)).collect();
        manager
            .seed_chat_history(&lines.join("\n"), "\n", &key)
            .await
            .unwrap();

        let history = manager.read_latest_history(&key).await.unwrap();
        let read: Vec<&str> = history.lines().collect();
        assert_eq!(read.len(), 30);
        assert_eq!(read.first(), Some(&"line 15"));
        assert_eq!(read.last(), Some(&"line 44"));
        assert_eq!(history, double_reverse_window(&lines));
    }

    #[test]
    fn test_window_matches_double_reverse() {
        for n in [0usize, 1, 29, 30, 31, 100] {
            let members: Vec<String> = (0..n).map(|i| i.to_string()).collect();
            assert_eq!(latest_window(&members, 30), double_reverse_window(&members));
        }
    }

    #[tokio::test]
    async fn test_missing_user_is_a_no_op() {
        let manager = manager();
        let key = CompanionKey::without_user("Ada", "gpt");

        assert_eq!(
            manager.write_to_history("hi", &key).await.unwrap(),
            WriteOutcome::Skipped
        );
        assert_eq!(manager.read_latest_history(&key).await.unwrap(), "");
        assert_eq!(
            manager.seed_chat_history("a\nb", "\n", &key).await.unwrap(),
            SeedOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn test_keys_with_separators_do_not_share_history() {
        let manager = manager();
        let left = CompanionKey::new("a-b", "x", "1");
        let right = CompanionKey::new("a", "b-x", "1");

        manager.write_to_history("left", &left).await.unwrap();
        manager.write_to_history("right", &right).await.unwrap();

        assert_eq!(manager.read_latest_history(&left).await.unwrap(), "left");
        assert_eq!(manager.read_latest_history(&right).await.unwrap(), "right");
    }

    #[tokio::test]
    async fn test_vector_search_filters_and_ranks() {
        let index = FakeIndex {
            matches: vec![
                chunk("ada.txt", "engines", 0.70),
                chunk("elon.txt", "rockets", 0.99),
                chunk("ada.txt", "poetry", 0.95),
                chunk("ada.txt", "numbers", 0.80),
                chunk("ada.txt", "looms", 0.60),
            ],
            ..Default::default()
        };
        let (manager, index) = manager_with(index, FakeEmbedder::returning(vec![0.3, 0.4]));

        let outcome = manager.vector_search("tell me about you", "ada.txt").await;
        let matches = match outcome {
            SearchOutcome::Matches(matches) => matches,
            other => panic!("expected matches, got {:?}", other),
        };

        let texts: Vec<&str> = matches.iter().filter_map(|m| m.text()).collect();
        assert_eq!(texts, vec!["poetry", "numbers", "engines"]);
        assert!(matches.iter().all(|m| m.file_name() == Some("ada.txt")));

        let queries = index.queries.lock().unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].top_k, 3);
        assert_eq!(queries[0].file_name, "ada.txt");
        assert_eq!(queries[0].vector, vec![0.3, 0.4]);
    }

    #[tokio::test]
    async fn test_vector_search_empty() {
        let manager = manager();
        let outcome = manager.vector_search("hello", "ada.txt").await;
        assert!(matches!(outcome, SearchOutcome::Empty));
    }

    #[tokio::test]
    async fn test_vector_search_invalid_embedding_fails_softly() {
        let (manager, index) = manager_with(FakeIndex::default(), FakeEmbedder::returning(vec![]));
        let outcome = manager.vector_search("hello", "ada.txt").await;

        assert!(matches!(
            outcome.error(),
            Some(MemoryError::InvalidEmbedding(_))
        ));
        assert!(outcome.into_matches().is_empty());
        assert!(index.queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vector_search_query_failure() {
        let index = FakeIndex {
            fail: true,
            ..Default::default()
        };
        let (manager, _) = manager_with(index, FakeEmbedder::returning(vec![0.1]));
        let outcome = manager.vector_search("hello", "ada.txt").await;

        let err = outcome.error().expect("query failure should be reported");
        assert!(err.is_upstream());
    }

    #[tokio::test]
    async fn test_slow_embedding_times_out() {
        let embedder = FakeEmbedder {
            vector: vec![0.1],
            delay: Some(Duration::from_secs(5)),
        };
        let manager = MemoryManager::with_backends(
            Arc::new(LocalHistoryStore::in_memory().unwrap()),
            Arc::new(FakeIndex::default()),
            Arc::new(embedder),
            MemorySettings {
                request_timeout: Duration::from_millis(20),
                ..MemorySettings::default()
            },
        );

        let outcome = manager.vector_search("hello", "ada.txt").await;
        assert!(matches!(
            outcome.error(),
            Some(MemoryError::Timeout {
                operation: "embedding",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_index_companion_file() {
        let (manager, index) =
            manager_with(FakeIndex::default(), FakeEmbedder::returning(vec![0.5, 0.5]));

        let written = manager
            .index_companion_file("ada.txt", "First paragraph.\n\nSecond paragraph.")
            .await
            .unwrap();
        assert_eq!(written, 1);

        let upserted = index.upserted.lock().unwrap();
        assert_eq!(upserted[0].id, "ada.txt-0");
        assert_eq!(upserted[0].metadata[FILE_NAME_FIELD], "ada.txt");
        assert_eq!(
            upserted[0].metadata[TEXT_FIELD],
            "First paragraph.\n\nSecond paragraph."
        );

        assert_eq!(manager.index_companion_file("ada.txt", "  \n\n ").await.unwrap(), 0);
    }

    #[test]
    fn test_chunk_text() {
        let chunks = chunk_text("aaaa\n\nbbbb\n\ncccc", 10);
        assert_eq!(chunks, vec!["aaaa\n\nbbbb", "cccc"]);

        let chunks = chunk_text("abcdefghij12345", 10);
        assert_eq!(chunks, vec!["abcdefghij", "12345"]);

        let chunks = chunk_text("one\r\n\r\ntwo", 100);
        assert_eq!(chunks, vec!["one\n\ntwo"]);

        assert!(chunk_text("", 10).is_empty());
    }

    #[test]
    fn test_health_reports_backends() {
        let health = manager().health();
        assert_eq!(health.history_backend, "redb");
        assert_eq!(health.vector_backend, "fake");
        assert_eq!(health.embedding_model, "fake-embedder");
    }

    #[tokio::test]
    async fn test_global_initializes_once() {
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let calls = calls.clone();
                tokio::spawn(async move {
                    let instance = MemoryManager::global_with(|| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(manager())
                    })
                    .await
                    .unwrap();
                    instance as *const MemoryManager as usize
                })
            })
            .collect();

        let mut addresses = Vec::new();
        for handle in handles {
            addresses.push(handle.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(addresses.windows(2).all(|w| w[0] == w[1]));
    }
}
