//! ============================================================================
//! Catalog Types - Serializable records for redb storage
//! ============================================================================

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Companion category shown in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
}

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

/// Billing state for one user.
/// Mirrors the Stripe subscription fields the settings page relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSubscription {
    pub user_id: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_price_id: Option<String>,
    /// Unix seconds when the paid period ends
    pub stripe_current_period_end: Option<i64>,
}

impl UserSubscription {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            stripe_customer_id: None,
            stripe_subscription_id: None,
            stripe_price_id: None,
            stripe_current_period_end: None,
        }
    }
}

/// Record counts for the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogStats {
    pub total_categories: usize,
    pub total_subscriptions: usize,
}
