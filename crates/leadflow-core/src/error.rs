//! Error types for Leadflow.
//!
//! Library crates return [`LeadflowError`]; the binary wraps it with `anyhow`.
//! Delivery failures carry their own classification so the dispatcher can
//! decide between retrying and giving up without string matching.

/// Top-level error type for all Leadflow operations.
#[derive(Debug, thiserror::Error)]
pub enum LeadflowError {
    /// Configuration loading or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Malformed input: bad recipient address, unknown template id, etc.
    /// Surfaced immediately, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Store unreachable or a statement failed. Aborts the current dispatch cycle.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Delivery provider failure.
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, LeadflowError>;

impl LeadflowError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether this error came from the store.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}

/// Classified delivery failure returned by every [`crate::DeliveryProvider`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Timeout, connection reset, provider 5xx or 429. Worth trying again.
    #[error("transient: {0}")]
    Transient(String),

    /// Invalid or blocked recipient, rejected payload. Never retried.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// The provider's message without the classification prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = LeadflowError::validation("unknown template 'x'");
        assert_eq!(err.to_string(), "validation error: unknown template 'x'");

        let err: LeadflowError = DeliveryError::permanent("mailbox does not exist").into();
        assert!(err.to_string().contains("permanent: mailbox does not exist"));
    }

    #[test]
    fn delivery_error_classification() {
        assert!(DeliveryError::transient("502 bad gateway").is_retryable());
        assert!(!DeliveryError::permanent("422 invalid to").is_retryable());
        assert_eq!(DeliveryError::transient("timeout").message(), "timeout");
    }

    #[test]
    fn persistence_predicate() {
        assert!(LeadflowError::persistence("locked").is_persistence());
        assert!(!LeadflowError::not_found("lead x").is_persistence());
    }
}
