//! ============================================================================
//! Local History Store - Embedded sorted sets on redb
//! ============================================================================
//! Same contract as the Upstash store for single-machine deployments and
//! tests. One table maps `(set key, member) -> score`; range queries scan
//! the key prefix and order by score, then member.
//! ============================================================================

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info};

use super::history::HistoryStore;
use super::types::HistoryEntry;
use crate::error::{MemoryError, Result};

const HISTORY: TableDefinition<(&str, &str), f64> = TableDefinition::new("history");

fn history_err(action: &str, e: impl std::fmt::Display) -> MemoryError {
    MemoryError::History(format!("Failed to {}: {}", action, e))
}

/// redb-backed sorted-set history
pub struct LocalHistoryStore {
    db: Database,
    path: Option<PathBuf>,
}

impl LocalHistoryStore {
    /// Open (or create) the history database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| history_err("create history directory", e))?;
            }
        }

        info!("Opening history database at: {}", path.display());
        let db = Database::create(path).map_err(|e| history_err("open history database", e))?;
        Self::init(db, Some(path.to_path_buf()))
    }

    /// Volatile store, dropped with the handle
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| history_err("create in-memory history", e))?;
        Self::init(db, None)
    }

    fn init(db: Database, path: Option<PathBuf>) -> Result<Self> {
        let write_txn = db.begin_write().map_err(|e| history_err("begin write", e))?;
        {
            let _ = write_txn
                .open_table(HISTORY)
                .map_err(|e| history_err("create history table", e))?;
        }
        write_txn.commit().map_err(|e| history_err("commit init", e))?;
        Ok(Self { db, path })
    }

    /// File backing this store, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn scan(&self, key: &str) -> Result<Vec<(f64, String)>> {
        let read_txn = self.db.begin_read().map_err(|e| history_err("begin read", e))?;
        let table = read_txn
            .open_table(HISTORY)
            .map_err(|e| history_err("open history table", e))?;

        let mut entries = Vec::new();
        let iter = table
            .range((key, "")..)
            .map_err(|e| history_err("iterate history", e))?;
        for item in iter {
            let (k, v) = item.map_err(|e| history_err("read history entry", e))?;
            let (set_key, member) = k.value();
            if set_key != key {
                break;
            }
            entries.push((v.value(), member.to_string()));
        }
        Ok(entries)
    }
}

#[async_trait]
impl HistoryStore for LocalHistoryStore {
    async fn add(&self, key: &str, entries: &[HistoryEntry]) -> Result<u64> {
        let write_txn = self.db.begin_write().map_err(|e| history_err("begin write", e))?;
        let mut added = 0;
        {
            let mut table = write_txn
                .open_table(HISTORY)
                .map_err(|e| history_err("open history table", e))?;
            for entry in entries {
                let is_new = table
                    .insert((key, entry.member.as_str()), entry.score)
                    .map_err(|e| history_err("insert history entry", e))?
                    .is_none();
                if is_new {
                    added += 1;
                }
            }
        }
        write_txn.commit().map_err(|e| history_err("commit", e))?;

        debug!("Added {} of {} entries to {}", added, entries.len(), key);
        Ok(added)
    }

    async fn range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut entries: Vec<(f64, String)> = self
            .scan(key)?
            .into_iter()
            .filter(|(score, _)| *score >= min && *score <= max)
            .collect();
        entries.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(entries.into_iter().map(|(_, member)| member).collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let read_txn = self.db.begin_read().map_err(|e| history_err("begin read", e))?;
        let table = read_txn
            .open_table(HISTORY)
            .map_err(|e| history_err("open history table", e))?;
        let mut iter = table
            .range((key, "")..)
            .map_err(|e| history_err("iterate history", e))?;
        match iter.next() {
            Some(item) => {
                let (k, _) = item.map_err(|e| history_err("read history entry", e))?;
                Ok(k.value().0 == key)
            }
            None => Ok(false),
        }
    }

    fn backend_name(&self) -> &'static str {
        "redb"
    }
}
