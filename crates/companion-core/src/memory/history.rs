//! ============================================================================
//! History Store - Sorted-set chat history
//! ============================================================================
//! Each companion key owns one sorted set; members are chat lines, scores
//! give chronological order. `UpstashHistoryStore` speaks the Upstash Redis
//! REST protocol; the embedded redb store lives in `history_local`.
//! ============================================================================

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::types::HistoryEntry;
use crate::error::{MemoryError, Result};

/// Sorted-set operations the memory manager relies on
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Add (or re-score) members; returns how many members were new
    async fn add(&self, key: &str, entries: &[HistoryEntry]) -> Result<u64>;

    /// Members with `min <= score <= max`, ascending by score then member
    async fn range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;

    /// Whether the key holds any members
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Backend name, for logs and health output
    fn backend_name(&self) -> &'static str;
}

/// History store backed by Upstash Redis over its REST API
pub struct UpstashHistoryStore {
    client: Client,
    url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct RestResponse {
    result: Option<Value>,
    error: Option<String>,
}

impl UpstashHistoryStore {
    pub fn new(url: &str, token: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// Send one Redis command as a JSON array and return its `result`
    async fn command(&self, command: Vec<Value>) -> Result<Value> {
        let name = command
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or("?")
            .to_string();
        debug!("Upstash {} ({} args)", name, command.len() - 1);

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&command)
            .send()
            .await
            .map_err(|e| MemoryError::History(format!("Failed to send {}: {}", name, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MemoryError::History(format!("Failed to read {} response: {}", name, e)))?;

        let parsed: RestResponse = serde_json::from_str(&body).map_err(|_| {
            MemoryError::History(format!("{} failed ({}): {}", name, status, body))
        })?;

        if let Some(error) = parsed.error {
            return Err(MemoryError::History(format!("{} failed: {}", name, error)));
        }
        if !status.is_success() {
            return Err(MemoryError::History(format!("{} failed ({})", name, status)));
        }

        Ok(parsed.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl HistoryStore for UpstashHistoryStore {
    async fn add(&self, key: &str, entries: &[HistoryEntry]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }
        let result = self.command(zadd_command(key, entries)).await?;
        result
            .as_u64()
            .ok_or_else(|| MemoryError::History(format!("Unexpected ZADD result: {}", result)))
    }

    async fn range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let result = self
            .command(vec![
                json!("ZRANGE"),
                json!(key),
                json!(format_score(min)),
                json!(format_score(max)),
                json!("BYSCORE"),
            ])
            .await?;
        parse_members(result)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let result = self.command(vec![json!("EXISTS"), json!(key)]).await?;
        parse_exists(result)
    }

    fn backend_name(&self) -> &'static str {
        "upstash"
    }
}

fn zadd_command(key: &str, entries: &[HistoryEntry]) -> Vec<Value> {
    let mut command = Vec::with_capacity(2 + entries.len() * 2);
    command.push(json!("ZADD"));
    command.push(json!(key));
    for entry in entries {
        command.push(json!(format_score(entry.score)));
        command.push(json!(entry.member));
    }
    command
}

/// Redis accepts scores as strings; integral scores are sent without a fraction
fn format_score(score: f64) -> String {
    if score.fract() == 0.0 && score.abs() < 9.0e15 {
        format!("{}", score as i64)
    } else {
        score.to_string()
    }
}

fn parse_members(result: Value) -> Result<Vec<String>> {
    match result {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect()),
        other => Err(MemoryError::History(format!(
            "Unexpected ZRANGE result: {}",
            other
        ))),
    }
}

fn parse_exists(result: Value) -> Result<bool> {
    result
        .as_u64()
        .map(|count| count > 0)
        .ok_or_else(|| MemoryError::History(format!("Unexpected EXISTS result: {}", result)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zadd_command_shape() {
        let entries = vec![HistoryEntry::new(0.0, "hi"), HistoryEntry::new(1.0, "there")];
        let command = zadd_command("Ada-gpt-u1", &entries);
        assert_eq!(
            Value::Array(command),
            json!(["ZADD", "Ada-gpt-u1", "0", "hi", "1", "there"])
        );
    }

    #[test]
    fn test_format_score() {
        assert_eq!(format_score(1_700_000_000_123.0), "1700000000123");
        assert_eq!(format_score(0.0), "0");
        assert_eq!(format_score(1.5), "1.5");
    }

    #[test]
    fn test_parse_members() {
        let members = parse_members(json!(["a", "b", 3])).unwrap();
        assert_eq!(members, vec!["a", "b", "3"]);
        assert!(parse_members(Value::Null).unwrap().is_empty());
        assert!(parse_members(json!("nope")).is_err());
    }

    #[test]
    fn test_parse_exists() {
        assert!(parse_exists(json!(1)).unwrap());
        assert!(!parse_exists(json!(0)).unwrap());
        // A malformed reply must not read as "no history"
        assert!(matches!(
            parse_exists(json!("OK")),
            Err(MemoryError::History(_))
        ));
        assert!(parse_exists(Value::Null).is_err());
    }

    #[test]
    fn test_rest_error_body() {
        let parsed: RestResponse =
            serde_json::from_str(r#"{"error":"WRONGTYPE Operation against a key"}"#).unwrap();
        assert!(parsed.result.is_none());
        assert_eq!(parsed.error.as_deref(), Some("WRONGTYPE Operation against a key"));
    }

    #[test]
    fn test_url_trailing_slash() {
        let store = UpstashHistoryStore::new("https://eu1.upstash.io/", "tok");
        assert_eq!(store.url, "https://eu1.upstash.io");
        assert_eq!(store.backend_name(), "upstash");
    }

    #[tokio::test]
    #[ignore]
    async fn test_live_roundtrip() {
        let url = std::env::var("UPSTASH_REDIS_REST_URL").unwrap();
        let token = std::env::var("UPSTASH_REDIS_REST_TOKEN").unwrap();
        let store = UpstashHistoryStore::new(&url, &token);

        let key = format!("test-{}", uuid::Uuid::new_v4());
        store
            .add(&key, &[HistoryEntry::new(1.0, "hello")])
            .await
            .unwrap();
        assert!(store.exists(&key).await.unwrap());
        let members = store.range_by_score(&key, 0.0, 2.0).await.unwrap();
        assert_eq!(members, vec!["hello"]);
    }
}
