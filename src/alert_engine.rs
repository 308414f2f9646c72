use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{defaults, AlertConfig};
use crate::models::{
    dedup_key, historical_low, latest_price, AlertEvent, PriceSnapshot, Product, ScrapedRecord, TriggerReason,
};
use crate::plugins::traits::Notifier;
use crate::storage::Storage;
use crate::utils::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct AlertPolicy {
    /// Percent, e.g. `10` for a 10% drop.
    pub percent_drop_threshold: Decimal,
    pub dedup_window: Duration,
}

impl From<&AlertConfig> for AlertPolicy {
    fn from(config: &AlertConfig) -> Self {
        Self {
            percent_drop_threshold: Decimal::try_from(config.percent_drop_threshold)
                .unwrap_or_else(|_| Decimal::try_from(defaults::PERCENT_DROP_THRESHOLD).unwrap_or(Decimal::TEN))
                .normalize(),
            dedup_window: Duration::hours(config.dedup_window_hours),
        }
    }
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self::from(&AlertConfig::default())
    }
}

/// Outcome of the rule chain for one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing noteworthy.
    Quiet,
    /// Price is still inside the target band it had already entered. Claims the
    /// observation so the lower rules cannot fire while the target holds.
    TargetHeld,
    Fire {
        reason: TriggerReason,
        /// Price the new one is compared against.
        reference: Option<Decimal>,
    },
}

/// Rule chain, first match wins:
/// 1. target reached (edge-triggered on the previous `current_price`)
/// 2. strictly below every prior snapshot
/// 3. at least `percent_drop_threshold` below the latest snapshot
pub fn decide(product: &Product, record: &ScrapedRecord, history: &[PriceSnapshot], policy: &AlertPolicy) -> Decision {
    let price = record.price;

    if let Some(target) = product.target_price {
        if price <= target {
            return match product.current_price {
                Some(previous) if previous <= target => Decision::TargetHeld,
                previous => Decision::Fire {
                    reason: TriggerReason::TargetReached,
                    reference: previous,
                },
            };
        }
    }

    if let Some(low) = historical_low(history) {
        if price < low {
            return Decision::Fire {
                reason: TriggerReason::NewLow,
                reference: Some(low),
            };
        }
    }

    if let Some(previous) = latest_price(history) {
        if previous > Decimal::ZERO && policy.percent_drop_threshold > Decimal::ZERO {
            let drop_percent = (previous - price) / previous * Decimal::ONE_HUNDRED;
            if drop_percent >= policy.percent_drop_threshold {
                return Decision::Fire {
                    reason: TriggerReason::PercentDrop,
                    reference: Some(previous),
                };
            }
        }
    }

    Decision::Quiet
}

/// Compares each successful scrape against the product's history, records the
/// observation, and emits deduplicated alerts.
pub struct AlertEngine {
    storage: Arc<dyn Storage>,
    notifier: Arc<dyn Notifier>,
    policy: AlertPolicy,
    /// dedup key -> when an alert with that key was last emitted
    ledger: Mutex<HashMap<String, DateTime<Utc>>>,
    deliveries: Mutex<JoinSet<()>>,
}

impl AlertEngine {
    pub fn new(storage: Arc<dyn Storage>, notifier: Arc<dyn Notifier>, policy: AlertPolicy) -> Self {
        Self {
            storage,
            notifier,
            policy,
            ledger: Mutex::new(HashMap::new()),
            deliveries: Mutex::new(JoinSet::new()),
        }
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    /// Fold `record` into `product`, persist one snapshot plus the new product state,
    /// and hand any alert to the notifier without waiting for delivery.
    pub async fn evaluate(
        &self,
        product: &mut Product,
        record: &ScrapedRecord,
        response_time: Option<std::time::Duration>,
    ) -> Result<Option<AlertEvent>> {
        self.evaluate_at(product, record, response_time, Utc::now()).await
    }

    pub async fn evaluate_at(
        &self,
        product: &mut Product,
        record: &ScrapedRecord,
        response_time: Option<std::time::Duration>,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertEvent>> {
        let history = self.storage.load_price_history(&product.id).await?;
        let decision = decide(product, record, &history, &self.policy);

        let response_time_ms = response_time.and_then(|d| i64::try_from(d.as_millis()).ok());
        let snapshot = PriceSnapshot::from_record(&product.id, record, response_time_ms);
        self.storage.append_snapshot(&snapshot).await?;

        product.apply_success(record, now);
        self.storage.save_product_state(product).await?;

        let (reason, reference) = match decision {
            Decision::Fire { reason, reference } => (reason, reference),
            Decision::TargetHeld | Decision::Quiet => {
                debug!(product_id = %product.id, price = %record.price, ?decision, "No alert");
                return Ok(None);
            }
        };

        if !self.claim_dedup_slot(&dedup_key(&product.id, reason), now) {
            counter!("alerts_suppressed_total", "reason" => reason.as_str()).increment(1);
            info!(
                product_id = %product.id,
                reason = reason.as_str(),
                "Alert suppressed: already emitted within the dedup window"
            );
            return Ok(None);
        }

        let event = AlertEvent::new(product, reference, record.price, reason, now);
        counter!("alerts_emitted_total", "reason" => reason.as_str()).increment(1);
        info!(
            product_id = %product.id,
            alert_id = %event.id,
            reason = reason.as_str(),
            new_price = %event.new_price,
            "Alert emitted"
        );

        self.dispatch(event.clone());
        Ok(Some(event))
    }

    /// `true` when no alert with `key` was emitted within the window; records `now`.
    fn claim_dedup_slot(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut ledger = self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let window = self.policy.dedup_window;

        if ledger.get(key).is_some_and(|last| now - *last < window) {
            return false;
        }

        ledger.retain(|_, last| now - *last < window);
        ledger.insert(key.to_string(), now);
        true
    }

    fn dispatch(&self, event: AlertEvent) {
        let notifier = Arc::clone(&self.notifier);
        let mut deliveries = self.deliveries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        // Reap finished deliveries
        while deliveries.try_join_next().is_some() {}

        deliveries.spawn(async move {
            if let Err(e) = notifier.deliver(&event).await {
                warn!(alert_id = %event.id, notifier = notifier.name(), "Alert delivery failed: {}", e);
            }
        });
    }

    /// Wait for every delivery handed off so far.
    pub async fn flush(&self) {
        let mut pending = {
            let mut deliveries = self.deliveries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *deliveries)
        };
        while pending.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Marketplace, NewProduct};
    use crate::plugins::traits::notifier::MockNotifier;
    use crate::storage::MemoryStorage;
    use crate::utils::error::AppError;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn product(target: Option<&str>) -> Product {
        Product::new(
            NewProduct {
                url: "https://www.amazon.com/dp/B08N5WRWNW".to_string(),
                marketplace: None,
                target_price: target.map(dec),
                check_interval_hours: 6,
            },
            Marketplace::Amazon,
        )
    }

    fn record(price: &str, at: DateTime<Utc>) -> ScrapedRecord {
        ScrapedRecord {
            price: dec(price),
            currency: "USD".to_string(),
            in_stock: true,
            title: Some("Echo Dot".to_string()),
            image_url: None,
            scraped_at: at,
        }
    }

    async fn seeded(product: &mut Product, prices: &[&str], storage: &MemoryStorage, start: DateTime<Utc>) {
        storage.insert_product(product).await.unwrap();
        for (i, price) in prices.iter().enumerate() {
            let at = start + Duration::minutes(i as i64);
            let rec = record(price, at);
            storage
                .append_snapshot(&PriceSnapshot::from_record(&product.id, &rec, None))
                .await
                .unwrap();
            product.apply_success(&rec, at);
        }
        storage.save_product_state(product).await.unwrap();
    }

    fn quiet_notifier() -> Arc<MockNotifier> {
        let mut notifier = MockNotifier::new();
        notifier.expect_name().return_const("mock".to_string());
        notifier.expect_deliver().returning(|_| Ok(()));
        Arc::new(notifier)
    }

    #[test]
    fn test_decide_rule_order() {
        let policy = AlertPolicy::default();
        let now = Utc::now();
        let history: Vec<PriceSnapshot> = ["60", "55"]
            .iter()
            .map(|p| PriceSnapshot::from_record("p", &record(p, now), None))
            .collect();

        let mut p = product(Some("50"));
        p.current_price = Some(dec("55"));
        // Also a new low and a >10% drop, but the target rule wins
        assert_eq!(
            decide(&p, &record("48", now), &history, &policy),
            Decision::Fire { reason: TriggerReason::TargetReached, reference: Some(dec("55")) }
        );

        p.current_price = Some(dec("48"));
        assert_eq!(decide(&p, &record("47", now), &history, &policy), Decision::TargetHeld);

        let untargeted = product(None);
        assert_eq!(
            decide(&untargeted, &record("54.99", now), &history, &policy),
            Decision::Fire { reason: TriggerReason::NewLow, reference: Some(dec("55")) }
        );
        assert_eq!(decide(&untargeted, &record("56", now), &history, &policy), Decision::Quiet);
    }

    #[test]
    fn test_decide_percent_drop_against_latest_snapshot() {
        let policy = AlertPolicy::default();
        let now = Utc::now();
        let history = vec![
            PriceSnapshot::from_record("p", &record("40", now - Duration::hours(2)), None),
            PriceSnapshot::from_record("p", &record("100", now - Duration::hours(1)), None),
        ];
        let p = product(None);

        assert_eq!(
            decide(&p, &record("90", now), &history, &policy),
            Decision::Fire { reason: TriggerReason::PercentDrop, reference: Some(dec("100")) }
        );
        assert_eq!(decide(&p, &record("90.01", now), &history, &policy), Decision::Quiet);
    }

    #[test]
    fn test_first_observation_below_target_fires() {
        let p = product(Some("50"));
        assert_eq!(
            decide(&p, &record("45", Utc::now()), &[], &AlertPolicy::default()),
            Decision::Fire { reason: TriggerReason::TargetReached, reference: None }
        );
        // No history: no new-low or percent-drop baseline
        assert_eq!(
            decide(&product(None), &record("45", Utc::now()), &[], &AlertPolicy::default()),
            Decision::Quiet
        );
    }

    #[tokio::test]
    async fn test_target_reached_then_suppressed_within_window() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let mut p = product(Some("50"));
        seeded(&mut p, &["60", "55"], &storage, now - Duration::hours(3)).await;

        let mut notifier = MockNotifier::new();
        notifier.expect_name().return_const("mock".to_string());
        notifier
            .expect_deliver()
            .withf(|event| event.trigger_reason == TriggerReason::TargetReached)
            .times(1)
            .returning(|_| Ok(()));
        let engine = AlertEngine::new(Arc::new(storage.clone()), Arc::new(notifier), AlertPolicy::default());

        let first = engine.evaluate_at(&mut p, &record("48", now), None, now).await.unwrap();
        let first = first.expect("target crossing alerts");
        assert_eq!(first.trigger_reason, TriggerReason::TargetReached);
        assert_eq!(first.old_price, Some(dec("55")));
        assert_eq!(first.new_price, dec("48"));

        let later = now + Duration::hours(1);
        let second = engine.evaluate_at(&mut p, &record("47", later), None, later).await.unwrap();
        assert!(second.is_none());

        engine.flush().await;
        assert_eq!(storage.snapshot_count(&p.id).await, 4, "one snapshot per evaluation");
        assert_eq!(p.current_price, Some(dec("47")));
    }

    #[tokio::test]
    async fn test_new_low_without_target() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let mut p = product(None);
        seeded(&mut p, &["45", "40", "42"], &storage, now - Duration::hours(5)).await;
        let engine = AlertEngine::new(Arc::new(storage.clone()), quiet_notifier(), AlertPolicy::default());

        let event = engine
            .evaluate_at(&mut p, &record("39.99", now), Some(std::time::Duration::from_millis(320)), now)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.trigger_reason, TriggerReason::NewLow);
        assert_eq!(event.old_price, Some(dec("40")));
        assert_eq!(event.dedup_key, format!("{}:new_low", p.id));

        let history = storage.load_price_history(&p.id).await.unwrap();
        assert_eq!(history.last().unwrap().response_time_ms, Some(320));
        engine.flush().await;
    }

    #[tokio::test]
    async fn test_dedup_window_expires() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let mut p = product(None);
        seeded(&mut p, &["100"], &storage, now - Duration::days(3)).await;
        let engine = AlertEngine::new(Arc::new(storage), quiet_notifier(), AlertPolicy::default());

        let t1 = now - Duration::hours(30);
        assert!(engine.evaluate_at(&mut p, &record("90", t1), None, t1).await.unwrap().is_some());

        let t2 = now - Duration::hours(29);
        assert!(engine.evaluate_at(&mut p, &record("80", t2), None, t2).await.unwrap().is_none());

        assert!(engine.evaluate_at(&mut p, &record("70", now), None, now).await.unwrap().is_some());
        engine.flush().await;
    }

    #[tokio::test]
    async fn test_delivery_failure_keeps_state() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let mut p = product(Some("20"));
        seeded(&mut p, &["25"], &storage, now - Duration::hours(1)).await;

        let mut notifier = MockNotifier::new();
        notifier.expect_name().return_const("mock".to_string());
        notifier
            .expect_deliver()
            .times(1)
            .returning(|_| Err(AppError::Internal("smtp down".to_string())));
        let engine = AlertEngine::new(Arc::new(storage.clone()), Arc::new(notifier), AlertPolicy::default());

        let event = engine.evaluate_at(&mut p, &record("19", now), None, now).await.unwrap();
        engine.flush().await;

        assert!(event.is_some());
        let saved = storage.load_product(&p.id).await.unwrap().unwrap();
        assert_eq!(saved.current_price, Some(dec("19")));
        assert_eq!(storage.snapshot_count(&p.id).await, 2);
    }

    #[test]
    fn test_policy_from_config() {
        let policy = AlertPolicy::from(&AlertConfig {
            percent_drop_threshold: 12.5,
            dedup_window_hours: 6,
        });
        assert_eq!(policy.percent_drop_threshold, dec("12.5"));
        assert_eq!(policy.dedup_window, Duration::hours(6));
    }
}
