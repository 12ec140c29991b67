//! ============================================================================
//! Memory Types - Keys, history entries and search results
//! ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// Separator between companion key fields in the history store
pub const KEY_SEPARATOR: char = '-';

/// Identifies one conversation: which companion, which model, which user
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanionKey {
    pub companion_name: String,
    pub model_name: String,
    /// Absent when the caller has no signed-in user
    pub user_id: Option<String>,
}

impl CompanionKey {
    pub fn new(
        companion_name: impl Into<String>,
        model_name: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            companion_name: companion_name.into(),
            model_name: model_name.into(),
            user_id: Some(user_id.into()),
        }
    }

    /// Key with no user attached; history operations on it are skipped
    pub fn without_user(companion_name: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            companion_name: companion_name.into(),
            model_name: model_name.into(),
            user_id: None,
        }
    }

    /// Derive the history-store key `companion-model-user`.
    ///
    /// `\` and `-` inside a field are escaped so distinct triples never share
    /// a key; fields without either character come out unchanged.
    pub fn store_key(&self) -> Result<String> {
        let user_id = match self.user_id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(MemoryError::InvalidKey(format!(
                    "no user id for companion '{}'",
                    self.companion_name
                )))
            }
        };

        let mut key = String::with_capacity(
            self.companion_name.len() + self.model_name.len() + user_id.len() + 2,
        );
        push_escaped(&mut key, &self.companion_name);
        key.push(KEY_SEPARATOR);
        push_escaped(&mut key, &self.model_name);
        key.push(KEY_SEPARATOR);
        push_escaped(&mut key, user_id);
        Ok(key)
    }
}

fn push_escaped(out: &mut String, field: &str) {
    for c in field.chars() {
        if c == '\\' || c == KEY_SEPARATOR {
            out.push('\\');
        }
        out.push(c);
    }
}

/// One chat line and its position in the sorted set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub score: f64,
    pub member: String,
}

impl HistoryEntry {
    pub fn new(score: f64, member: impl Into<String>) -> Self {
        Self {
            score,
            member: member.into(),
        }
    }
}

/// Knowledge chunk metadata paired with its similarity to the query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMatch {
    pub document: serde_json::Map<String, serde_json::Value>,
    pub score: f32,
}

impl SimilarityMatch {
    /// `fileName` recorded in the chunk metadata, if any
    pub fn file_name(&self) -> Option<&str> {
        self.document.get(FILE_NAME_FIELD).and_then(|v| v.as_str())
    }

    /// Chunk text recorded in the metadata, if any
    pub fn text(&self) -> Option<&str> {
        self.document.get(TEXT_FIELD).and_then(|v| v.as_str())
    }
}

/// Metadata field holding the companion knowledge file name
pub const FILE_NAME_FIELD: &str = "fileName";

/// Metadata field holding the chunk text
pub const TEXT_FIELD: &str = "text";

/// Nearest-neighbour query against a vector index
#[derive(Debug, Clone, PartialEq)]
pub struct VectorQuery {
    pub vector: Vec<f32>,
    pub top_k: u64,
    /// Only chunks whose `fileName` metadata equals this are returned
    pub file_name: String,
}

/// Vector plus metadata to upsert into an index
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Result of `write_to_history`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Store acknowledged the write; `added` is the number of new members
    Written { added: u64 },
    /// Companion key had no user; nothing was written
    Skipped,
}

/// Result of `seed_chat_history`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Seeded { lines: usize },
    /// History already existed for this key; left untouched
    AlreadySeeded,
    /// Companion key had no user; nothing was written
    Skipped,
}

/// Result of `vector_search`, keeping "nothing found" apart from "failed"
#[derive(Debug)]
pub enum SearchOutcome {
    Matches(Vec<SimilarityMatch>),
    Empty,
    Failed(MemoryError),
}

impl SearchOutcome {
    /// Matches, or an empty list for both `Empty` and `Failed`
    pub fn into_matches(self) -> Vec<SimilarityMatch> {
        match self {
            SearchOutcome::Matches(matches) => matches,
            SearchOutcome::Empty | SearchOutcome::Failed(_) => Vec::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SearchOutcome::Failed(_))
    }

    pub fn error(&self) -> Option<&MemoryError> {
        match self {
            SearchOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_key_format() {
        let key = CompanionKey::new("Einstein", "llama2-13b", "user_123");
        assert_eq!(key.store_key().unwrap(), "Einstein-llama2\\-13b-user_123");

        let key = CompanionKey::new("Elon", "gpt", "user_42");
        assert_eq!(key.store_key().unwrap(), "Elon-gpt-user_42");
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = CompanionKey::new("Ada", "gpt", "u1");
        let b = CompanionKey::new("Ada", "gpt", "u1");
        assert_eq!(a.store_key().unwrap(), b.store_key().unwrap());
    }

    #[test]
    fn test_separator_in_field_does_not_collide() {
        let left = CompanionKey::new("a-b", "x", "1").store_key().unwrap();
        let right = CompanionKey::new("a", "b-x", "1").store_key().unwrap();
        assert_ne!(left, right);

        // Escapes themselves are escaped
        let slash = CompanionKey::new("a\\", "b", "1").store_key().unwrap();
        let dash = CompanionKey::new("a", "\\b", "1").store_key().unwrap();
        assert_ne!(slash, dash);
    }

    #[test]
    fn test_missing_user_is_invalid() {
        let key = CompanionKey::without_user("Ada", "gpt");
        assert!(matches!(key.store_key(), Err(MemoryError::InvalidKey(_))));

        let key = CompanionKey::new("Ada", "gpt", "");
        assert!(matches!(key.store_key(), Err(MemoryError::InvalidKey(_))));
    }

    #[test]
    fn test_key_serializes_camel_case() {
        let key = CompanionKey::new("Ada", "gpt", "u1");
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json["companionName"], "Ada");
        assert_eq!(json["userId"], "u1");
    }

    #[test]
    fn test_search_outcome_legacy_view() {
        let failed = SearchOutcome::Failed(MemoryError::Embedding("boom".into()));
        assert!(failed.is_failed());
        assert!(failed.into_matches().is_empty());
        assert!(SearchOutcome::Empty.into_matches().is_empty());
    }
}
