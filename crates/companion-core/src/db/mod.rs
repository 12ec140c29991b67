// ============================================================================
// CatalogDb - Embedded Database (redb)
// ============================================================================
// Categories and user subscriptions for the companion catalog.
// Default path: ~/.companion/catalog.redb (override via COMPANION_DB_PATH)
// ============================================================================

pub mod types;

pub use types::{CatalogStats, Category, UserSubscription};

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::default_data_file;
use crate::error::{MemoryError, Result};

// Table definitions
const CATEGORIES: TableDefinition<&str, &[u8]> = TableDefinition::new("categories");
const SUBSCRIPTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("subscriptions");

/// Categories every fresh catalog starts with
pub const DEFAULT_CATEGORIES: [&str; 10] = [
    "Famous People",
    "Movies & Tv",
    "Musicians",
    "Games",
    "Animals",
    "Philosophy",
    "Scientists",
    "Entrepreneurs",
    "Super Heroes",
    "Birds",
];

fn catalog_err(action: &str, e: impl std::fmt::Display) -> MemoryError {
    MemoryError::Catalog(format!("Failed to {}: {}", action, e))
}

/// Embedded catalog database. Dropping it closes the file.
pub struct CatalogDb {
    db: Database,
    path: Option<PathBuf>,
}

impl CatalogDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses COMPANION_DB_PATH env var or ~/.companion/catalog.redb
    pub fn open(path: Option<&str>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var("COMPANION_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            default_data_file("catalog.redb")?
        };

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| catalog_err("create catalog directory", e))?;
            }
        }

        info!("Opening catalog database at: {}", db_path.display());

        let db = Database::create(&db_path).map_err(|e| catalog_err("open database", e))?;
        Self::init(db, Some(db_path))
    }

    /// Volatile catalog, dropped with the handle
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| catalog_err("create in-memory database", e))?;
        Self::init(db, None)
    }

    fn init(db: Database, path: Option<PathBuf>) -> Result<Self> {
        // Ensure tables exist by doing a write transaction
        let write_txn = db.begin_write().map_err(|e| catalog_err("begin write", e))?;
        {
            let _ = write_txn
                .open_table(CATEGORIES)
                .map_err(|e| catalog_err("create categories table", e))?;
            let _ = write_txn
                .open_table(SUBSCRIPTIONS)
                .map_err(|e| catalog_err("create subscriptions table", e))?;
        }
        write_txn.commit().map_err(|e| catalog_err("commit init", e))?;

        debug!("Catalog database ready");
        Ok(Self { db, path })
    }

    /// Database file path, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ========================================================================
    // Category Operations
    // ========================================================================

    /// Insert categories whose names are not present yet; returns how many were added
    pub fn create_many(&self, names: &[&str]) -> Result<usize> {
        let mut known: Vec<String> = self
            .list_categories()?
            .into_iter()
            .map(|c| c.name)
            .collect();

        let write_txn = self.db.begin_write().map_err(|e| catalog_err("begin write", e))?;
        let mut created = 0;
        {
            let mut table = write_txn
                .open_table(CATEGORIES)
                .map_err(|e| catalog_err("open categories table", e))?;

            for name in names {
                if known.iter().any(|k| k.as_str() == *name) {
                    debug!("Category already present: {}", name);
                    continue;
                }
                let category = Category::new(*name);
                let key = format!("categories:{}", category.id);
                let value = bincode::serialize(&category)
                    .map_err(|e| catalog_err("serialize category", e))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(|e| catalog_err("insert category", e))?;
                known.push(category.name);
                created += 1;
            }
        }
        write_txn.commit().map_err(|e| catalog_err("commit", e))?;

        info!("Created {} categories", created);
        Ok(created)
    }

    /// All categories, sorted by name
    pub fn list_categories(&self) -> Result<Vec<Category>> {
        let read_txn = self.db.begin_read().map_err(|e| catalog_err("begin read", e))?;
        let table = read_txn
            .open_table(CATEGORIES)
            .map_err(|e| catalog_err("open categories table", e))?;

        let mut results = Vec::new();
        let iter = table
            .range::<&str>(..)
            .map_err(|e| catalog_err("iterate categories", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| catalog_err("read entry", e))?;
            let category: Category = bincode::deserialize(value.value())
                .map_err(|e| catalog_err("deserialize category", e))?;
            results.push(category);
        }
        results.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(results)
    }

    // ========================================================================
    // Subscription Operations
    // ========================================================================

    pub fn upsert_subscription(&self, subscription: &UserSubscription) -> Result<()> {
        let key = format!("subscriptions:{}", subscription.user_id);
        let value = bincode::serialize(subscription)
            .map_err(|e| catalog_err("serialize subscription", e))?;

        let write_txn = self.db.begin_write().map_err(|e| catalog_err("begin write", e))?;
        {
            let mut table = write_txn
                .open_table(SUBSCRIPTIONS)
                .map_err(|e| catalog_err("open subscriptions table", e))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(|e| catalog_err("insert subscription", e))?;
        }
        write_txn.commit().map_err(|e| catalog_err("commit", e))?;

        debug!("Stored subscription for user: {}", subscription.user_id);
        Ok(())
    }

    pub fn get_subscription(&self, user_id: &str) -> Result<Option<UserSubscription>> {
        let key = format!("subscriptions:{}", user_id);

        let read_txn = self.db.begin_read().map_err(|e| catalog_err("begin read", e))?;
        let table = read_txn
            .open_table(SUBSCRIPTIONS)
            .map_err(|e| catalog_err("open subscriptions table", e))?;

        match table
            .get(key.as_str())
            .map_err(|e| catalog_err("get subscription", e))?
        {
            Some(value) => {
                let subscription: UserSubscription = bincode::deserialize(value.value())
                    .map_err(|e| catalog_err("deserialize subscription", e))?;
                Ok(Some(subscription))
            }
            None => Ok(None),
        }
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<CatalogStats> {
        let read_txn = self.db.begin_read().map_err(|e| catalog_err("begin read", e))?;
        let categories = read_txn
            .open_table(CATEGORIES)
            .map_err(|e| catalog_err("open categories table", e))?;
        let subscriptions = read_txn
            .open_table(SUBSCRIPTIONS)
            .map_err(|e| catalog_err("open subscriptions table", e))?;

        Ok(CatalogStats {
            total_categories: categories
                .len()
                .map_err(|e| catalog_err("count categories", e))? as usize,
            total_subscriptions: subscriptions
                .len()
                .map_err(|e| catalog_err("count subscriptions", e))? as usize,
        })
    }
}
