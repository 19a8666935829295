//! Delivery failover: try primary, then fallbacks, on transient errors.
//!
//! Unhealthy providers (too many consecutive failures) are skipped until a
//! cool-down has passed. Permanent errors stop the chain: another provider
//! would reject the same recipient.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use leadflow_core::error::DeliveryError;
use leadflow_core::traits::{DeliveryProvider, DeliveryReceipt, OutboundMessage};

/// Per-provider health tracking.
struct ProviderSlot {
    provider: Arc<dyn DeliveryProvider>,
    /// Consecutive transient failures.
    failures: AtomicU32,
    /// Unix secs of last failure, 0 = never.
    last_failure: AtomicU64,
    max_failures: u32,
    cooldown_secs: u64,
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl ProviderSlot {
    fn new(provider: Arc<dyn DeliveryProvider>) -> Self {
        Self {
            provider,
            failures: AtomicU32::new(0),
            last_failure: AtomicU64::new(0),
            max_failures: 3,
            cooldown_secs: 60,
        }
    }

    fn is_healthy_at(&self, now: u64) -> bool {
        if self.failures.load(Ordering::Relaxed) < self.max_failures {
            return true;
        }
        now.saturating_sub(self.last_failure.load(Ordering::Relaxed)) > self.cooldown_secs
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure.store(unix_now(), Ordering::Relaxed);
    }
}

/// Failover chain. The receipt names whichever provider delivered.
pub struct FailoverProvider {
    slots: Vec<ProviderSlot>,
}

impl FailoverProvider {
    /// First provider is primary, the rest are fallbacks in order.
    pub fn new(providers: Vec<Arc<dyn DeliveryProvider>>) -> Self {
        Self {
            slots: providers.into_iter().map(ProviderSlot::new).collect(),
        }
    }

    pub fn with_fallback(
        primary: Arc<dyn DeliveryProvider>,
        fallback: Arc<dyn DeliveryProvider>,
    ) -> Self {
        Self::new(vec![primary, fallback])
    }

    pub fn chain_len(&self) -> usize {
        self.slots.len()
    }

    /// `(name, healthy, consecutive failures)` per provider.
    pub fn health_status(&self) -> Vec<(&str, bool, u32)> {
        let now = unix_now();
        self.slots
            .iter()
            .map(|s| {
                (
                    s.provider.name(),
                    s.is_healthy_at(now),
                    s.failures.load(Ordering::Relaxed),
                )
            })
            .collect()
    }
}

#[async_trait]
impl DeliveryProvider for FailoverProvider {
    fn name(&self) -> &str {
        "failover"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DeliveryError> {
        let mut last_error = None;
        let now = unix_now();

        for (idx, slot) in self.slots.iter().enumerate() {
            if !slot.is_healthy_at(now) {
                tracing::debug!(
                    "⏭️ Skipping unhealthy provider: {} ({} failures)",
                    slot.provider.name(),
                    slot.failures.load(Ordering::Relaxed)
                );
                continue;
            }

            match slot.provider.send(message).await {
                Ok(receipt) => {
                    if idx > 0 {
                        tracing::info!(
                            "🔄 Failover: {} → {} (delivered)",
                            self.slots[0].provider.name(),
                            slot.provider.name()
                        );
                    }
                    slot.record_success();
                    return Ok(receipt);
                }
                Err(e @ DeliveryError::Permanent(_)) => return Err(e),
                Err(e) => {
                    slot.record_failure();
                    tracing::warn!(
                        "⚠️ Provider {} failed ({} in a row): {}",
                        slot.provider.name(),
                        slot.failures.load(Ordering::Relaxed),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DeliveryError::transient("all delivery providers unhealthy")))
    }
}
