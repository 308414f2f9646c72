use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::notifiers::{DiscordNotifier, EmailNotifier, LogNotifier};
use super::traits::Notifier;
use crate::config::NotificationsConfig;
use crate::models::AlertEvent;
use crate::utils::error::AppError;

pub type NotifierBox = Box<dyn Notifier>;

/// Registry of delivery channels. Delivering through the manager fans the event out to
/// every registered notifier; one channel failing never stops the others.
#[derive(Clone)]
pub struct PluginManager {
    notifiers: Arc<RwLock<Vec<NotifierBox>>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self {
            notifiers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a notifier, replacing any existing one with the same name.
    pub async fn register_notifier(&self, notifier: NotifierBox) {
        let mut notifiers = self.notifiers.write().await;
        notifiers.retain(|existing| existing.name() != notifier.name());
        debug!("Registered notifier: {}", notifier.name());
        notifiers.push(notifier);
    }

    pub async fn has_notifier(&self, name: &str) -> bool {
        let notifiers = self.notifiers.read().await;
        notifiers.iter().any(|n| n.name() == name)
    }

    pub async fn list_notifiers(&self) -> Vec<String> {
        let notifiers = self.notifiers.read().await;
        notifiers.iter().map(|n| n.name().to_string()).collect()
    }

    /// Log sink plus every channel that has configuration.
    pub async fn initialize_default_plugins(&self, config: &NotificationsConfig) -> Result<(), AppError> {
        self.register_notifier(Box::new(LogNotifier)).await;

        if let Some(discord) = DiscordNotifier::from_config(&config.discord) {
            self.register_notifier(Box::new(discord)).await;
        }
        if let Some(email) = EmailNotifier::from_config(&config.smtp)? {
            self.register_notifier(Box::new(email)).await;
        }

        Ok(())
    }

    /// Deliver through every notifier concurrently. Returns how many succeeded.
    pub async fn broadcast(&self, event: &AlertEvent) -> usize {
        let notifiers = self.notifiers.read().await;
        let results = join_all(notifiers.iter().map(|notifier| async move {
            let result = notifier.deliver(event).await;
            if let Err(e) = &result {
                warn!(
                    notifier = notifier.name(),
                    alert_id = %event.id,
                    "Alert delivery failed: {}",
                    e
                );
            }
            result
        }))
        .await;

        results.iter().filter(|r| r.is_ok()).count()
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for PluginManager {
    fn name(&self) -> &str {
        "plugin-manager"
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), AppError> {
        self.broadcast(event).await;
        Ok(())
    }
}
