use async_trait::async_trait;
use tracing::info;

use crate::models::AlertEvent;
use crate::plugins::traits::Notifier;
use crate::utils::error::AppError;

/// Always-on sink that writes every alert to the structured log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), AppError> {
        info!(
            alert_id = %event.id,
            product_id = %event.product_id,
            marketplace = %event.marketplace,
            reason = %event.trigger_reason,
            new_price = %event.new_price,
            old_price = ?event.old_price,
            "{}",
            event.summary()
        );
        Ok(())
    }
}
