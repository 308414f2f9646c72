use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::config::DiscordConfig;
use crate::models::{AlertEvent, TriggerReason};
use crate::plugins::traits::Notifier;
use crate::utils::error::AppError;

/// Posts alert embeds to a Discord webhook.
pub struct DiscordNotifier {
    client: Client,
    webhook_url: String,
    username: String,
    avatar_url: Option<String>,
}

impl DiscordNotifier {
    pub fn new(webhook_url: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            webhook_url: webhook_url.into(),
            username: username.into(),
            avatar_url: None,
        }
    }

    /// `None` when no webhook is configured.
    pub fn from_config(config: &DiscordConfig) -> Option<Self> {
        let webhook_url = config.webhook_url.as_ref()?;
        let mut notifier = Self::new(webhook_url.clone(), config.username.clone());
        notifier.avatar_url = config.avatar_url.clone();
        Some(notifier)
    }

    fn embed_color(reason: TriggerReason) -> u32 {
        match reason {
            TriggerReason::TargetReached => 0x00ff00, // Green
            TriggerReason::NewLow => 0x0099ff,        // Blue
            TriggerReason::PercentDrop => 0xff9900,   // Orange
        }
    }

    fn emoji(reason: TriggerReason) -> &'static str {
        match reason {
            TriggerReason::TargetReached => "🎯",
            TriggerReason::NewLow => "📉",
            TriggerReason::PercentDrop => "💰",
        }
    }

    fn create_embed(&self, event: &AlertEvent) -> serde_json::Value {
        let name = event.title.as_deref().unwrap_or(&event.product_url);
        let mut fields = vec![json!({
            "name": "New price",
            "value": format!("{} {}", event.new_price, event.currency),
            "inline": true
        })];

        if let Some(old_price) = event.old_price {
            fields.push(json!({
                "name": "Previous price",
                "value": format!("{} {}", old_price, event.currency),
                "inline": true
            }));
        }
        if let Some(percent) = event.percent_change {
            fields.push(json!({
                "name": "Change",
                "value": format!("{}%", percent),
                "inline": true
            }));
        }
        fields.push(json!({
            "name": "Marketplace",
            "value": format!("[{}]({})", event.marketplace, event.product_url),
            "inline": false
        }));

        json!({
            "title": format!("{} {}", Self::emoji(event.trigger_reason), name),
            "description": event.summary(),
            "url": event.product_url,
            "color": Self::embed_color(event.trigger_reason),
            "timestamp": event.created_at.to_rfc3339(),
            "fields": fields,
            "footer": { "text": format!("price-sentinel · {}", event.trigger_reason) }
        })
    }

    fn create_webhook_payload(&self, event: &AlertEvent) -> serde_json::Value {
        let mut payload = json!({
            "username": self.username,
            "embeds": [self.create_embed(event)]
        });

        if let Some(avatar_url) = &self.avatar_url {
            payload["avatar_url"] = json!(avatar_url);
        }

        payload
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    fn name(&self) -> &str {
        "discord"
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), AppError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&self.create_webhook_payload(event))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::Notification {
                notifier: self.name().to_string(),
                message: format!("webhook returned {}", response.status()),
            });
        }

        Ok(())
    }
}
