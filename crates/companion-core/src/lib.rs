//! ============================================================================
//! COMPANION-CORE: Conversational memory for companion chat
//! ============================================================================
//! This crate handles all backend logic for companion chat:
//! - Per-conversation chat history in sorted sets (Upstash REST or redb)
//! - Knowledge-file similarity search (Pinecone or Qdrant + embeddings)
//! - Catalog database for categories and subscriptions (redb)
//! - Pro/free subscription gating
//! ============================================================================

pub mod config;
pub mod db;
pub mod error;
pub mod memory;
pub mod subscription;

// Re-export main types for convenience
pub use config::MemoryConfig;
pub use db::{CatalogDb, Category, UserSubscription, DEFAULT_CATEGORIES};
pub use error::{MemoryError, Result};
pub use memory::{CompanionKey, MemoryManager, SearchOutcome, SeedOutcome, WriteOutcome};
pub use subscription::{SubscriptionGate, SubscriptionStatus};
