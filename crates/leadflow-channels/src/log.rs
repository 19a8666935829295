//! Dry-run provider: logs the message instead of sending it.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use leadflow_core::error::DeliveryError;
use leadflow_core::traits::{DeliveryProvider, DeliveryReceipt, OutboundMessage};

#[derive(Default)]
pub struct LogProvider {
    delivered: AtomicU64,
}

impl LogProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages "delivered" since start.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeliveryProvider for LogProvider {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DeliveryError> {
        let n = self.delivered.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            "📝 [dry-run #{}] to={} subject={:?} ({} bytes)",
            n,
            message.to,
            message.subject,
            message.html.len()
        );
        Ok(DeliveryReceipt {
            id: format!("log-{}", uuid::Uuid::new_v4()),
            provider: self.name().to_string(),
        })
    }
}
