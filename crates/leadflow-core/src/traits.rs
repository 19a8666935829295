//! Delivery provider seam: the only outbound I/O the engine performs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// A fully rendered message ready for a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    /// HTML markup.
    pub html: String,
}

/// Proof of delivery. `provider` names the provider that actually delivered,
/// which matters when a failover chain is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub id: String,
    pub provider: String,
}

/// Something that can deliver a message (HTTP email API, SMTP, ...).
///
/// Implementations must classify every failure as transient or permanent.
/// They should not retry internally; the dispatcher owns the retry policy.
#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DeliveryError>;
}
