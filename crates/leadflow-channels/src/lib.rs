//! # Leadflow Channels
//! Delivery provider implementations behind [`DeliveryProvider`].
//!
//! - `http`: JSON email API (Resend-compatible)
//! - `smtp`: STARTTLS relay via lettre
//! - `log`: dry run, logs only
//! - failover chain when `delivery.fallback` is set

pub mod email;
pub mod failover;
pub mod http_api;
pub mod log;

use std::sync::Arc;
use std::time::Duration;

use leadflow_core::config::{DeliveryConfig, ProviderKind};
use leadflow_core::error::Result;
use leadflow_core::traits::DeliveryProvider;

pub use email::SmtpProvider;
pub use failover::FailoverProvider;
pub use http_api::HttpApiProvider;
pub use log::LogProvider;

/// Build one provider of the given kind.
pub fn build_single(
    kind: ProviderKind,
    config: &DeliveryConfig,
    timeout: Duration,
) -> Result<Arc<dyn DeliveryProvider>> {
    Ok(match kind {
        ProviderKind::Log => Arc::new(LogProvider::new()),
        ProviderKind::Http => Arc::new(HttpApiProvider::from_config(config, timeout)?),
        ProviderKind::Smtp => Arc::new(SmtpProvider::from_config(config, timeout)?),
    })
}

/// Build the configured provider, wrapped in a failover chain when a
/// fallback kind is set.
pub fn build_provider(config: &DeliveryConfig, timeout: Duration) -> Result<Arc<dyn DeliveryProvider>> {
    let primary = build_single(ProviderKind::parse(&config.provider)?, config, timeout)?;
    let Some(fallback) = config.fallback.as_deref() else {
        tracing::info!("📮 Delivery provider: {}", primary.name());
        return Ok(primary);
    };
    let fallback = build_single(ProviderKind::parse(fallback)?, config, timeout)?;
    tracing::info!(
        "📮 Delivery provider: {} (fallback {})",
        primary.name(),
        fallback.name()
    );
    Ok(Arc::new(FailoverProvider::with_fallback(primary, fallback)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_default_is_log() {
        let provider = build_provider(&DeliveryConfig::default(), Duration::from_secs(5)).unwrap();
        assert_eq!(provider.name(), "log");
    }

    #[test]
    fn test_build_with_fallback() {
        let mut config = DeliveryConfig::default();
        config.provider = "http".into();
        config.http.api_key = "re_test".into();
        config.fallback = Some("log".into());
        let provider = build_provider(&config, Duration::from_secs(5)).unwrap();
        assert_eq!(provider.name(), "failover");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut config = DeliveryConfig::default();
        config.provider = "pigeon".into();
        assert!(build_provider(&config, Duration::from_secs(5)).is_err());
    }
}
