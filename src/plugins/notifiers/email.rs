use async_trait::async_trait;
use lettre::message::{header, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::SmtpConfig;
use crate::models::{AlertEvent, TriggerReason};
use crate::plugins::traits::Notifier;
use crate::utils::error::AppError;

/// Sends each alert as a plain-text + HTML email over SMTP.
pub struct EmailNotifier {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    recipients: Vec<Mailbox>,
}

impl EmailNotifier {
    /// `Ok(None)` when SMTP is not configured; `Err` when it is configured but unusable.
    pub fn from_config(config: &SmtpConfig) -> Result<Option<Self>, AppError> {
        let (Some(host), Some(from_address)) = (&config.host, &config.from_address) else {
            return Ok(None);
        };
        if config.recipients.is_empty() {
            return Ok(None);
        }

        let from = format!("{} <{}>", config.from_name, from_address)
            .parse::<Mailbox>()
            .map_err(|e| Self::error(format!("invalid from address: {}", e)))?;
        let recipients = config
            .recipients
            .iter()
            .map(|r| r.parse::<Mailbox>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Self::error(format!("invalid recipient: {}", e)))?;

        let mut builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| Self::error(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        }
        .port(config.port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Some(Self {
            mailer: builder.build(),
            from,
            recipients,
        }))
    }

    fn error(message: String) -> AppError {
        AppError::Notification {
            notifier: "email".to_string(),
            message,
        }
    }

    fn format_subject(event: &AlertEvent) -> String {
        let name = event.title.as_deref().unwrap_or(&event.product_url);
        match event.trigger_reason {
            TriggerReason::TargetReached => format!("🎯 Target reached: {} - {} {}", name, event.new_price, event.currency),
            TriggerReason::NewLow => format!("📉 New low: {} - {} {}", name, event.new_price, event.currency),
            TriggerReason::PercentDrop => format!("🔔 Price drop: {} - {} {}", name, event.new_price, event.currency),
        }
    }

    fn format_text_body(event: &AlertEvent) -> String {
        let mut text = String::new();

        text.push_str("PRICE SENTINEL ALERT\n\n");
        text.push_str(&format!("{}\n\n", event.summary()));
        text.push_str(&format!("Marketplace: {}\n", event.marketplace));
        if let Some(old_price) = event.old_price {
            text.push_str(&format!("Previous price: {} {}\n", old_price, event.currency));
        }
        text.push_str(&format!("New price: {} {}\n", event.new_price, event.currency));
        text.push_str(&format!("URL: {}\n", event.product_url));

        text
    }

    fn format_html_body(event: &AlertEvent) -> String {
        let name = event.title.as_deref().unwrap_or(&event.product_url);
        let previous = event
            .old_price
            .map(|old| format!("<strong>Previous price:</strong> {} {}<br>", old, event.currency))
            .unwrap_or_default();

        format!(
            r#"<!DOCTYPE html>
<html>
<body style="font-family: Arial, sans-serif; margin: 20px;">
    <div style="background: #f0f0f0; padding: 15px; border-radius: 5px;">
        <div style="font-size: 18px; font-weight: bold;">{}</div>
    </div>
    <div style="margin: 15px 0; padding: 10px; background: #e8f5e8; border-left: 4px solid #4CAF50;">
        {}<strong>New price:</strong> {} {}
    </div>
    <p>{}</p>
    <a href="{}" style="display: inline-block; padding: 8px 15px; background: #007cba; color: white; text-decoration: none;">View on {}</a>
</body>
</html>"#,
            name,
            previous,
            event.new_price,
            event.currency,
            event.summary(),
            event.product_url,
            event.marketplace
        )
    }

    fn build_message(&self, event: &AlertEvent) -> Result<Message, AppError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(Self::format_subject(event));
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }

        builder
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(header::ContentType::TEXT_PLAIN)
                            .body(Self::format_text_body(event)),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(header::ContentType::TEXT_HTML)
                            .body(Self::format_html_body(event)),
                    ),
            )
            .map_err(|e| Self::error(e.to_string()))
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), AppError> {
        let message = self.build_message(event)?;
        self.mailer
            .send(message)
            .await
            .map_err(|e| Self::error(e.to_string()))?;
        Ok(())
    }
}
