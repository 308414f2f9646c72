use async_trait::async_trait;

use crate::models::AlertEvent;
use crate::utils::error::AppError;

/// Delivery channel for alert events (log, Discord, email, ...).
///
/// Delivery is best effort: the alert engine has already persisted the price
/// observation before `deliver` is called, and a failed delivery is only logged.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &AlertEvent) -> Result<(), AppError>;
}
