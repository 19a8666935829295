//! JSON email API provider (Resend-style).
//!
//! `POST {endpoint}` with a bearer key and
//! `{"from", "to": [..], "subject", "html"}`; success answers `{"id": "..."}`.

use std::time::Duration;

use async_trait::async_trait;
use leadflow_core::config::DeliveryConfig;
use leadflow_core::error::{DeliveryError, LeadflowError, Result};
use leadflow_core::traits::{DeliveryProvider, DeliveryReceipt, OutboundMessage};
use serde::Deserialize;

#[derive(Deserialize)]
struct SendResponse {
    #[serde(default)]
    id: Option<String>,
}

pub struct HttpApiProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    from: String,
}

impl HttpApiProvider {
    pub fn new(endpoint: &str, api_key: &str, from: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LeadflowError::config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            from: from.to_string(),
        })
    }

    pub fn from_config(config: &DeliveryConfig, timeout: Duration) -> Result<Self> {
        if config.http.api_key.is_empty() {
            return Err(LeadflowError::config(
                "delivery.http.api_key is required for the http provider",
            ));
        }
        Self::new(&config.http.endpoint, &config.http.api_key, &config.from, timeout)
    }
}

#[async_trait]
impl DeliveryProvider for HttpApiProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(
        &self,
        message: &OutboundMessage,
    ) -> std::result::Result<DeliveryReceipt, DeliveryError> {
        let body = serde_json::json!({
            "from": self.from,
            "to": [message.to],
            "subject": message.subject,
            "html": message.html,
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let text: String = text.chars().take(300).collect();
            let msg = format!("HTTP {}: {}", status.as_u16(), text);
            return if status.is_server_error()
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                || status == reqwest::StatusCode::REQUEST_TIMEOUT
            {
                Err(DeliveryError::transient(msg))
            } else {
                Err(DeliveryError::permanent(msg))
            };
        }

        let parsed: SendResponse = resp
            .json()
            .await
            .unwrap_or(SendResponse { id: None });
        let id = parsed.id.unwrap_or_else(|| {
            tracing::debug!("Email API accepted {} without an id", message.to);
            "unknown".into()
        });

        tracing::debug!("📤 Email API accepted message for {} ({})", message.to, id);
        Ok(DeliveryReceipt {
            id,
            provider: self.name().to_string(),
        })
    }
}

fn classify_request_error(e: reqwest::Error) -> DeliveryError {
    if e.is_builder() {
        DeliveryError::permanent(format!("request rejected: {e}"))
    } else if e.is_timeout() {
        DeliveryError::transient(format!("timed out: {e}"))
    } else {
        DeliveryError::transient(format!("request failed: {e}"))
    }
}
