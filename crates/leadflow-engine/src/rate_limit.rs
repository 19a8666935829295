//! Per-recipient-domain send throttle.
//!
//! Fixed windows stored in the shared database, so every worker process sees
//! the same counters. Each call counts, allowed or not.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use leadflow_core::config::RateLimitConfig;
use leadflow_core::error::Result;

use crate::persistence::SequenceStore;

/// Answer for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Sends counted in the current window, this one included.
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

/// Shared fixed-window limiter.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<SequenceStore>,
    window: Duration,
    max_per_window: u32,
}

impl RateLimiter {
    pub fn new(store: Arc<SequenceStore>, window: Duration, max_per_window: u32) -> Self {
        Self {
            store,
            window,
            max_per_window,
        }
    }

    pub fn from_config(store: Arc<SequenceStore>, config: &RateLimitConfig) -> Self {
        Self::new(store, config.window(), config.max_per_window)
    }

    /// Count one send to `domain` now.
    pub fn allow(&self, domain: &str) -> Result<RateDecision> {
        self.allow_at(domain, Utc::now())
    }

    pub fn allow_at(&self, domain: &str, now: DateTime<Utc>) -> Result<RateDecision> {
        let key = format!("domain:{}", domain.to_ascii_lowercase());
        let hit = self.store.hit_window(&key, now, self.window)?;
        let allowed = hit.count <= self.max_per_window;
        if !allowed {
            tracing::debug!(
                "⏳ Rate limit hit for {} ({}/{} until {})",
                domain,
                hit.count,
                self.max_per_window,
                hit.reset_at
            );
        }
        Ok(RateDecision {
            allowed,
            count: hit.count,
            reset_at: hit.reset_at,
        })
    }
}
