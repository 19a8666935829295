//! SMTP delivery via async lettre (STARTTLS relay). Works with Gmail,
//! Outlook or any relay that accepts authenticated submission.

use std::time::Duration;

use async_trait::async_trait;
use leadflow_core::config::DeliveryConfig;
use leadflow_core::error::{DeliveryError, LeadflowError, Result};
use leadflow_core::traits::{DeliveryProvider, DeliveryReceipt, OutboundMessage};
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};

pub struct SmtpProvider {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpProvider {
    pub fn from_config(config: &DeliveryConfig, timeout: Duration) -> Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| LeadflowError::config(format!("Invalid from '{}': {e}", config.from)))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp.host)
            .map_err(|e| LeadflowError::config(format!("SMTP relay: {e}")))?
            .port(config.smtp.port)
            .timeout(Some(timeout));
        if !config.smtp.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.smtp.username.clone(),
                config.smtp.password.clone(),
            ));
        }

        Ok(Self {
            mailer: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl DeliveryProvider for SmtpProvider {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(
        &self,
        message: &OutboundMessage,
    ) -> std::result::Result<DeliveryReceipt, DeliveryError> {
        let to: Mailbox = message
            .to
            .parse()
            .map_err(|e| DeliveryError::permanent(format!("Invalid to '{}': {e}", message.to)))?;

        let message_id = format!("<{}@leadflow>", uuid::Uuid::new_v4());
        let email = LettreMessage::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.clone())
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_HTML)
            .body(message.html.clone())
            .map_err(|e| DeliveryError::permanent(format!("Build email: {e}")))?;

        match self.mailer.send(email).await {
            Ok(_) => {
                tracing::info!("📤 Email sent to: {}", message.to);
                Ok(DeliveryReceipt {
                    id: message_id,
                    provider: self.name().to_string(),
                })
            }
            // 5xx replies: the relay refused this recipient or payload for good.
            Err(e) if e.is_permanent() => Err(DeliveryError::permanent(format!("SMTP send: {e}"))),
            Err(e) => Err(DeliveryError::transient(format!("SMTP send: {e}"))),
        }
    }
}
