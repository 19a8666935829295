//! Leadflow configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LeadflowError, Result};

/// Upper bound for every duration setting (30 days).
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 3600;

/// Upper bound for `dispatch.in_request_attempts`.
pub const MAX_IN_REQUEST_ATTEMPTS: u32 = 10;

/// `secs` as a chrono duration, clamped to [`MAX_DURATION_SECS`].
pub fn bounded_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadflowConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub unsubscribe: UnsubscribeConfig,
}

impl LeadflowConfig {
    /// Load config from the default path (~/.leadflow/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load config from a specific path. Environment overrides are not applied.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LeadflowError::config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| LeadflowError::config(format!("Failed to parse config: {e}")))
    }

    /// Save config to a path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| LeadflowError::config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Leadflow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".leadflow")
    }

    /// Secrets come from the environment when set, never only from the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("LEADFLOW_API_KEY") {
            self.gateway.api_key = Some(v);
        }
        if let Some(v) = get("LEADFLOW_DELIVERY_API_KEY") {
            self.delivery.http.api_key = v;
        }
        if let Some(v) = get("LEADFLOW_SMTP_PASSWORD") {
            self.delivery.smtp.password = v;
        }
        if let Some(v) = get("LEADFLOW_UNSUBSCRIBE_SECRET") {
            self.unsubscribe.secret = v;
        }
        if let Some(v) = get("LEADFLOW_DATABASE_PATH") {
            self.database.path = v;
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.interval_secs == 0 {
            return Err(LeadflowError::config("dispatch.interval_secs must be > 0"));
        }
        if self.dispatch.batch_size == 0 {
            return Err(LeadflowError::config("dispatch.batch_size must be > 0"));
        }
        if self.dispatch.in_request_attempts == 0 {
            return Err(LeadflowError::config(
                "dispatch.in_request_attempts must be > 0",
            ));
        }
        if self.dispatch.in_request_attempts > MAX_IN_REQUEST_ATTEMPTS {
            return Err(LeadflowError::config(format!(
                "dispatch.in_request_attempts must be <= {MAX_IN_REQUEST_ATTEMPTS}"
            )));
        }
        if self.rate_limit.window_secs == 0 || self.rate_limit.max_per_window == 0 {
            return Err(LeadflowError::config(
                "rate_limit.window_secs and rate_limit.max_per_window must be > 0",
            ));
        }
        for (name, secs) in [
            ("dispatch.interval_secs", self.dispatch.interval_secs),
            ("dispatch.claim_ttl_secs", self.dispatch.claim_ttl_secs),
            ("dispatch.send_timeout_secs", self.dispatch.send_timeout_secs),
            ("dispatch.backoff_base_ms", self.dispatch.backoff_base_ms / 1000),
            ("dispatch.retry_delay_base_secs", self.dispatch.retry_delay_base_secs),
            ("dispatch.retry_delay_cap_secs", self.dispatch.retry_delay_cap_secs),
            ("rate_limit.window_secs", self.rate_limit.window_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(LeadflowError::config(format!(
                    "{name} exceeds the {MAX_DURATION_SECS}s limit"
                )));
            }
        }
        let worst_delivery = self.dispatch.worst_case_delivery_secs();
        if self.dispatch.claim_ttl_secs <= worst_delivery {
            return Err(LeadflowError::config(format!(
                "dispatch.claim_ttl_secs ({}) must exceed one item's worst-case delivery time ({worst_delivery}s)",
                self.dispatch.claim_ttl_secs
            )));
        }
        ProviderKind::parse(&self.delivery.provider)?;
        if let Some(fallback) = &self.delivery.fallback {
            ProviderKind::parse(fallback)?;
        }
        if self.unsubscribe.secret.is_empty() {
            tracing::warn!("⚠️ unsubscribe.secret is empty, unsubscribe links are forgeable");
        }
        Ok(())
    }

    /// Database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).to_string())
    }
}

/// SQLite store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "~/.leadflow/leadflow.db".into()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Dispatch worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Poll interval of the background loop.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Max due items fetched per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// A claim older than this is treated as abandoned and may be re-claimed.
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,
    /// Upper bound for a single provider call.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// Provider calls per item per cycle before giving up until the next cycle.
    #[serde(default = "default_in_request_attempts")]
    pub in_request_attempts: u32,
    /// In-cycle backoff base: waits base, 2·base, 4·base ...
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Cross-cycle retries before a transiently failing item is failed permanently.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// Cross-cycle delay base: min(cap, base · 2^retry_count).
    #[serde(default = "default_retry_delay_base_secs")]
    pub retry_delay_base_secs: u64,
    #[serde(default = "default_retry_delay_cap_secs")]
    pub retry_delay_cap_secs: u64,
}

fn default_interval_secs() -> u64 { 60 }
fn default_batch_size() -> u32 { 50 }
fn default_claim_ttl_secs() -> u64 { 600 }
fn default_send_timeout_secs() -> u64 { 15 }
fn default_in_request_attempts() -> u32 { 3 }
fn default_backoff_base_ms() -> u64 { 1000 }
fn default_max_retry_count() -> u32 { 5 }
fn default_retry_delay_base_secs() -> u64 { 60 }
fn default_retry_delay_cap_secs() -> u64 { 3600 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            claim_ttl_secs: default_claim_ttl_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            in_request_attempts: default_in_request_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            max_retry_count: default_max_retry_count(),
            retry_delay_base_secs: default_retry_delay_base_secs(),
            retry_delay_cap_secs: default_retry_delay_cap_secs(),
        }
    }
}

impl DispatchConfig {
    /// Longest time one item can stay claimed by a live worker: every
    /// in-cycle attempt timing out plus the backoff between them.
    pub fn worst_case_delivery_secs(&self) -> u64 {
        let attempts = self.in_request_attempts.clamp(1, MAX_IN_REQUEST_ATTEMPTS);
        let backoff_ms = (1..attempts).fold(0u64, |acc, n| {
            acc.saturating_add(self.backoff_base_ms.saturating_mul(1 << (n - 1)))
        });
        self.send_timeout_secs
            .max(1)
            .saturating_mul(u64::from(attempts))
            .saturating_add(backoff_ms.div_ceil(1000))
    }

    pub fn claim_ttl(&self) -> chrono::Duration {
        bounded_secs(self.claim_ttl_secs)
    }
}

/// Per-recipient-domain fixed window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_per_window")]
    pub max_per_window: u32,
}

fn default_window_secs() -> u64 { 3600 }
fn default_max_per_window() -> u32 { 100 }

impl RateLimitConfig {
    pub fn window(&self) -> chrono::Duration {
        bounded_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_per_window: default_max_per_window(),
        }
    }
}

/// Which delivery provider implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Logs instead of sending. Local development.
    Log,
    /// JSON email API over HTTPS.
    Http,
    Smtp,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "http" => Ok(Self::Http),
            "smtp" => Ok(Self::Smtp),
            other => Err(LeadflowError::config(format!(
                "unknown delivery provider '{other}' (expected log, http or smtp)"
            ))),
        }
    }
}

/// Delivery provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// `log`, `http` or `smtp`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Optional secondary provider kind tried on transient failure.
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default = "default_from")]
    pub from: String,
    #[serde(default)]
    pub http: HttpApiConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
}

fn default_provider() -> String { "log".into() }
fn default_from() -> String { "Blueprint Team <hello@example.com>".into() }

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            fallback: None,
            from: default_from(),
            http: HttpApiConfig::default(),
            smtp: SmtpConfig::default(),
        }
    }
}

/// JSON email API (`POST {endpoint}` with bearer auth, answers `{"id": ...}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpApiConfig {
    #[serde(default = "default_http_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
}

fn default_http_endpoint() -> String { "https://api.resend.com/emails".into() }

impl Default for HttpApiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_http_endpoint(),
            api_key: String::new(),
        }
    }
}

/// SMTP relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_smtp_host() -> String { "smtp.gmail.com".into() }
fn default_smtp_port() -> u16 { 587 }

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
        }
    }
}

/// HTTP gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer key for `/api/v1/*`. `None` leaves the API open.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL used in unsubscribe links.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 3100 }
fn default_public_base_url() -> String { "http://localhost:3100".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: None,
            public_base_url: default_public_base_url(),
        }
    }
}

/// Unsubscribe link signing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnsubscribeConfig {
    #[serde(default)]
    pub secret: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LeadflowConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.in_request_attempts, 3);
        assert_eq!(config.rate_limit.max_per_window, 100);
        assert_eq!(config.delivery.provider, "log");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = LeadflowConfig::from_toml(
            r#"
            [rate_limit]
            max_per_window = 3
            window_secs = 60

            [delivery]
            provider = "http"
            fallback = "smtp"
            "#,
        )
        .unwrap();
        assert_eq!(config.rate_limit.max_per_window, 3);
        assert_eq!(config.dispatch.interval_secs, 60);
        assert_eq!(config.delivery.fallback.as_deref(), Some("smtp"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = LeadflowConfig::default();
        config.rate_limit.window_secs = 0;
        assert!(config.validate().is_err());

        let mut config = LeadflowConfig::default();
        config.delivery.provider = "carrier-pigeon".into();
        assert!(matches!(config.validate(), Err(LeadflowError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_out_of_range_durations() {
        let mut config = LeadflowConfig::default();
        config.dispatch.claim_ttl_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(LeadflowError::Config(_))));

        let mut config = LeadflowConfig::default();
        config.rate_limit.window_secs = MAX_DURATION_SECS + 1;
        assert!(config.validate().is_err());

        let mut config = LeadflowConfig::default();
        config.dispatch.retry_delay_cap_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = LeadflowConfig::default();
        config.dispatch.in_request_attempts = 50;
        assert!(config.validate().is_err());

        // Clamped instead of overflowing.
        assert_eq!(bounded_secs(u64::MAX).num_seconds(), MAX_DURATION_SECS as i64);
    }

    #[test]
    fn test_claim_ttl_must_outlast_one_delivery() {
        let config = LeadflowConfig::default();
        // 3 attempts x 15s + (1s + 2s) backoff
        assert_eq!(config.dispatch.worst_case_delivery_secs(), 48);

        let mut config = LeadflowConfig::default();
        config.dispatch.claim_ttl_secs = 48;
        assert!(config.validate().is_err());
        config.dispatch.claim_ttl_secs = 49;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = LeadflowConfig::default();
        config.apply_overrides(|key| match key {
            "LEADFLOW_UNSUBSCRIBE_SECRET" => Some("s3cret".into()),
            "LEADFLOW_API_KEY" => Some("   ".into()),
            _ => None,
        });
        assert_eq!(config.unsubscribe.secret, "s3cret");
        assert!(config.gateway.api_key.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = LeadflowConfig::default();
        config.gateway.port = 4242;
        config.save_to(&path).unwrap();

        let loaded = LeadflowConfig::load_from(&path).unwrap();
        assert_eq!(loaded.gateway.port, 4242);
    }
}
