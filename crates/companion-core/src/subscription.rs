//! ============================================================================
//! Subscription Gate - Pro/free plan status with a short-lived cache
//! ============================================================================
//! A user is Pro while their subscription has a price id and the paid period
//! (plus one day of grace) has not ended.
//! ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::db::{CatalogDb, UserSubscription};
use crate::error::Result;

/// Grace period after `stripe_current_period_end`, in seconds
pub const GRACE_PERIOD_SECS: i64 = 86_400;

/// Default cache duration in seconds
pub const DEFAULT_CACHE_DURATION_SECS: i64 = 60;

/// Maximum number of entries in the status cache
const MAX_CACHE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Free,
    Pro,
}

impl SubscriptionStatus {
    /// Evaluate a stored subscription at time `now` (unix seconds)
    pub fn evaluate(subscription: Option<&UserSubscription>, now: i64) -> Self {
        let Some(sub) = subscription else {
            return SubscriptionStatus::Free;
        };
        match (&sub.stripe_price_id, sub.stripe_current_period_end) {
            (Some(_), Some(period_end)) if period_end.saturating_add(GRACE_PERIOD_SECS) > now => {
                SubscriptionStatus::Pro
            }
            _ => SubscriptionStatus::Free,
        }
    }

    pub fn is_pro(&self) -> bool {
        matches!(self, SubscriptionStatus::Pro)
    }

    /// Line shown on the settings page
    pub fn plan_message(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pro => "You are currently on a Pro plan.",
            SubscriptionStatus::Free => "You are on a free Plan.",
        }
    }
}

#[derive(Debug, Clone)]
struct CachedStatus {
    status: SubscriptionStatus,
    cached_at: i64,
}

/// Subscription lookups with caching
pub struct SubscriptionGate {
    db: Arc<CatalogDb>,
    cache: RwLock<HashMap<String, CachedStatus>>,
    cache_duration_secs: i64,
}

impl SubscriptionGate {
    pub fn new(db: Arc<CatalogDb>) -> Self {
        Self::with_cache_duration(db, DEFAULT_CACHE_DURATION_SECS)
    }

    pub fn with_cache_duration(db: Arc<CatalogDb>, cache_duration_secs: i64) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
            cache_duration_secs,
        }
    }

    /// Plan status for `user_id`; an absent user is always Free
    pub async fn check(&self, user_id: Option<&str>) -> Result<SubscriptionStatus> {
        let Some(user_id) = user_id.filter(|id| !id.is_empty()) else {
            return Ok(SubscriptionStatus::Free);
        };
        let now = chrono::Utc::now().timestamp();

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(user_id) {
                if now - cached.cached_at < self.cache_duration_secs {
                    debug!("Cache hit for user {}: {:?}", user_id, cached.status);
                    return Ok(cached.status);
                }
            }
        }

        let subscription = self.db.get_subscription(user_id)?;
        let status = SubscriptionStatus::evaluate(subscription.as_ref(), now);

        {
            let mut cache = self.cache.write().await;
            if cache.len() >= MAX_CACHE_SIZE {
                if let Some(oldest_key) = cache
                    .iter()
                    .min_by_key(|(_, v)| v.cached_at)
                    .map(|(k, _)| k.clone())
                {
                    cache.remove(&oldest_key);
                }
            }
            cache.insert(
                user_id.to_string(),
                CachedStatus {
                    status,
                    cached_at: now,
                },
            );
        }

        debug!("Subscription status for {}: {:?}", user_id, status);
        Ok(status)
    }

    /// Drop the cached status for a user (e.g. after a billing webhook)
    pub async fn invalidate(&self, user_id: &str) {
        if self.cache.write().await.remove(user_id).is_some() {
            info!("Invalidated subscription cache for user {}", user_id);
        }
    }
}
