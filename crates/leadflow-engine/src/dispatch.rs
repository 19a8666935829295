//! Dispatch worker: drains due queue items, one cycle at a time.
//!
//! Per item: claim → render → rate check → send with in-cycle retries →
//! record the outcome. Several workers may run against the same database;
//! the conditional claim in [`SequenceStore::claim`] guarantees each item is
//! handed to at most one of them.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use leadflow_core::config::{DispatchConfig, bounded_secs};
use leadflow_core::error::{DeliveryError, Result};
use leadflow_core::traits::{DeliveryProvider, DeliveryReceipt, OutboundMessage};
use leadflow_core::types::recipient_domain;
use serde::Serialize;
use tokio::sync::watch;

use crate::links::UnsubscribeLinks;
use crate::persistence::{DueItem, SequenceStore};
use crate::rate_limit::RateLimiter;
use crate::render;

/// Counters for one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Items selected as due.
    pub due: usize,
    pub sent: usize,
    /// Rate-limited; left for a later cycle without counting a retry.
    pub deferred: usize,
    /// Transient failure; rescheduled with backoff.
    pub retried: usize,
    /// Terminal failure.
    pub failed: usize,
    /// Claimed by another worker first.
    pub contended: usize,
}

impl DispatchReport {
    pub fn is_idle(&self) -> bool {
        self.due == 0
    }
}

/// The cycle's reference time advanced by the real time spent in the cycle.
/// Claims and outcomes are stamped with it, so a lease is measured from the
/// moment an item was claimed, not from the start of a long cycle.
#[derive(Debug, Clone, Copy)]
struct CycleClock {
    start: DateTime<Utc>,
    started: Instant,
}

impl CycleClock {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            started: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        Duration::from_std(self.started.elapsed())
            .ok()
            .and_then(|elapsed| self.start.checked_add_signed(elapsed))
            .unwrap_or(self.start)
    }
}

/// One dispatch worker. Cheap to share behind an `Arc`.
pub struct DispatchWorker {
    worker_id: String,
    store: Arc<SequenceStore>,
    provider: Arc<dyn DeliveryProvider>,
    limiter: RateLimiter,
    links: UnsubscribeLinks,
    config: DispatchConfig,
}

impl DispatchWorker {
    pub fn new(
        store: Arc<SequenceStore>,
        provider: Arc<dyn DeliveryProvider>,
        limiter: RateLimiter,
        links: UnsubscribeLinks,
        config: DispatchConfig,
    ) -> Self {
        let worker_id = format!("worker-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        Self {
            worker_id,
            store,
            provider,
            limiter,
            links,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run one cycle now.
    pub async fn run_once(&self) -> Result<DispatchReport> {
        self.run_once_at(Utc::now()).await
    }

    /// Run one cycle as of `now`. A store failure aborts the cycle and is
    /// returned; items already processed keep their recorded outcome.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let clock = CycleClock::new(now);
        let due = self
            .store
            .due_items(now, now - self.config.claim_ttl(), self.config.batch_size)?;

        let mut report = DispatchReport {
            due: due.len(),
            ..Default::default()
        };
        for item in due {
            self.process(item, &clock, &mut report).await?;
        }

        if !report.is_idle() {
            tracing::info!(
                "📮 [{}] cycle: {} due, {} sent, {} deferred, {} retried, {} failed, {} contended",
                self.worker_id,
                report.due,
                report.sent,
                report.deferred,
                report.retried,
                report.failed,
                report.contended
            );
        }
        Ok(report)
    }

    async fn process(
        &self,
        due: DueItem,
        clock: &CycleClock,
        report: &mut DispatchReport,
    ) -> Result<()> {
        let DueItem { item, recipient } = due;

        let now = clock.now();
        let stale_before = now - self.config.claim_ttl();
        if !self.store.claim(&item.id, &self.worker_id, now, stale_before)? {
            report.contended += 1;
            return Ok(());
        }

        let Some(domain) = recipient_domain(&recipient.email) else {
            let reason = format!("invalid recipient address '{}'", recipient.email);
            self.store.mark_failed(&item, &self.worker_id, now, &reason)?;
            tracing::warn!("⚠️ Item {} failed: {}", item.id, reason);
            report.failed += 1;
            return Ok(());
        };

        let unsubscribe_url = self.links.url(&item.lead_id);
        let message = match render::render(&item.template_id, &recipient, &item.context, &unsubscribe_url)
        {
            Ok(message) => message,
            Err(e) => {
                self.store.mark_failed(&item, &self.worker_id, now, &e.to_string())?;
                tracing::warn!("⚠️ Item {} failed: {}", item.id, e);
                report.failed += 1;
                return Ok(());
            }
        };

        let decision = match self.limiter.allow_at(&domain, now) {
            Ok(decision) => decision,
            Err(e) => {
                let _ = self.store.release_claim(&item.id, &self.worker_id);
                return Err(e);
            }
        };
        if !decision.allowed {
            // Held until the window resets so it stops crowding other domains out of the batch.
            self.store
                .defer(&item.id, &self.worker_id, decision.reset_at)?;
            report.deferred += 1;
            return Ok(());
        }

        let outcome = self.deliver_with_retry(&message).await;
        let now = clock.now();
        match outcome {
            Ok(receipt) => {
                if self.store.mark_sent(&item, &self.worker_id, now, &receipt)? {
                    tracing::info!(
                        "✉️ Sent {} #{} to {} via {} ({})",
                        item.template_id,
                        item.position,
                        recipient.email,
                        receipt.provider,
                        receipt.id
                    );
                    report.sent += 1;
                } else {
                    // Re-claimed by another worker after the TTL while sending.
                    tracing::warn!("⚠️ Item {} sent but claim was lost", item.id);
                }
            }
            Err(DeliveryError::Permanent(reason)) => {
                self.store.mark_failed(&item, &self.worker_id, now, &reason)?;
                tracing::warn!("❌ Item {} permanently failed: {}", item.id, reason);
                report.failed += 1;
            }
            Err(DeliveryError::Transient(reason)) => {
                if item.retry_count >= self.config.max_retry_count {
                    let reason = format!("gave up after {} retries: {reason}", item.retry_count);
                    self.store.mark_failed(&item, &self.worker_id, now, &reason)?;
                    tracing::warn!("❌ Item {} failed: {}", item.id, reason);
                    report.failed += 1;
                } else {
                    let next_attempt_at = now + self.retry_delay(item.retry_count);
                    let count =
                        self.store
                            .record_retry(&item.id, &self.worker_id, &reason, next_attempt_at)?;
                    tracing::warn!(
                        "🔁 Item {} retry {}/{} at {}: {}",
                        item.id,
                        count,
                        self.config.max_retry_count,
                        next_attempt_at,
                        reason
                    );
                    report.retried += 1;
                }
            }
        }
        Ok(())
    }

    /// Up to `in_request_attempts` sends with exponential backoff between
    /// them. Permanent errors stop immediately.
    async fn deliver_with_retry(
        &self,
        message: &OutboundMessage,
    ) -> std::result::Result<DeliveryReceipt, DeliveryError> {
        let attempts = self.config.in_request_attempts.max(1);
        let timeout = StdDuration::from_secs(self.config.send_timeout_secs.max(1));
        let mut last = DeliveryError::transient("no attempt made");

        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = self.config.backoff_base_ms.saturating_mul(1 << (attempt - 1).min(16));
                tokio::time::sleep(StdDuration::from_millis(backoff)).await;
            }
            match tokio::time::timeout(timeout, self.provider.send(message)).await {
                Ok(Ok(receipt)) => return Ok(receipt),
                Ok(Err(e)) if !e.is_retryable() => return Err(e),
                Ok(Err(e)) => {
                    tracing::debug!(
                        "{} attempt {}/{} for {}: {}",
                        self.provider.name(),
                        attempt + 1,
                        attempts,
                        message.to,
                        e
                    );
                    last = e;
                }
                Err(_) => {
                    last = DeliveryError::transient(format!(
                        "send timed out after {}s",
                        timeout.as_secs()
                    ));
                }
            }
        }
        Err(last)
    }

    /// Cross-cycle delay before retry number `retry_count + 1`.
    fn retry_delay(&self, retry_count: u32) -> Duration {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let secs = self
            .config
            .retry_delay_base_secs
            .saturating_mul(factor)
            .min(self.config.retry_delay_cap_secs);
        bounded_secs(secs)
    }
}

/// Run dispatch cycles every `interval_secs` until `shutdown` flips to `true`
/// or its sender is dropped. A cycle in progress always finishes first.
pub async fn spawn_dispatcher(
    worker: Arc<DispatchWorker>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(
        "⏰ Dispatcher {} started (check every {}s)",
        worker.worker_id(),
        interval_secs
    );

    let mut interval = tokio::time::interval(StdDuration::from_secs(interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = worker.run_once().await {
            tracing::error!("❌ Dispatch cycle aborted: {}", e);
        }
    }

    tracing::info!("🛑 Dispatcher {} stopped", worker.worker_id());
}
