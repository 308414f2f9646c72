use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{generate_id, Marketplace, Product, TriggerReason};

/// Fully-formed alert payload handed to the notification side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertEvent {
    pub id: String,
    pub product_id: String,
    pub product_url: String,
    pub marketplace: Marketplace,
    pub title: Option<String>,
    pub old_price: Option<Decimal>,
    pub new_price: Decimal,
    pub currency: String,
    /// Negative for drops, relative to `old_price`.
    pub percent_change: Option<Decimal>,
    pub trigger_reason: TriggerReason,
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(
        product: &Product,
        old_price: Option<Decimal>,
        new_price: Decimal,
        trigger_reason: TriggerReason,
        now: DateTime<Utc>,
    ) -> Self {
        let percent_change = old_price
            .filter(|old| !old.is_zero())
            .map(|old| ((new_price - old) / old * Decimal::ONE_HUNDRED).round_dp(2).normalize());

        Self {
            id: generate_id(),
            product_id: product.id.clone(),
            product_url: product.url.clone(),
            marketplace: product.marketplace,
            title: product.title.clone(),
            old_price,
            new_price,
            currency: product.currency.clone(),
            percent_change,
            trigger_reason,
            dedup_key: dedup_key(&product.id, trigger_reason),
            created_at: now,
        }
    }

    /// Human-readable one-liner used by the plain-text channels.
    pub fn summary(&self) -> String {
        let name = self.title.as_deref().unwrap_or(&self.product_url);
        let headline = match self.trigger_reason {
            TriggerReason::TargetReached => "Target price reached",
            TriggerReason::NewLow => "New all-time low",
            TriggerReason::PercentDrop => "Price drop",
        };
        match (self.old_price, self.percent_change) {
            (Some(old), Some(pct)) => format!(
                "{}: {} now {} {} (was {}, {}%)",
                headline, name, self.new_price, self.currency, old, pct
            ),
            _ => format!("{}: {} now {} {}", headline, name, self.new_price, self.currency),
        }
    }
}

/// Alerts sharing this key are deduplicated against each other.
pub fn dedup_key(product_id: &str, reason: TriggerReason) -> String {
    format!("{}:{}", product_id, reason.as_str())
}
