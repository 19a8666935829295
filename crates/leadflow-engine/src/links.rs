//! Signed unsubscribe links.
//!
//! `token = base64url(HMAC-SHA256(secret, lead_id))`. The public unsubscribe
//! endpoint verifies it in constant time so nobody can unsubscribe a lead by
//! guessing its id.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use leadflow_core::error::{LeadflowError, Result};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Builds and verifies unsubscribe links.
#[derive(Clone)]
pub struct UnsubscribeLinks {
    base_url: String,
    /// Keyed once; cloned per token.
    keyed: HmacSha256,
}

impl UnsubscribeLinks {
    pub fn new(base_url: &str, secret: &str) -> Result<Self> {
        let keyed = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| LeadflowError::config(format!("unsubscribe secret: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            keyed,
        })
    }

    pub fn token(&self, lead_id: &str) -> String {
        let mut mac = self.keyed.clone();
        mac.update(lead_id.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    pub fn verify(&self, lead_id: &str, token: &str) -> bool {
        let Ok(raw) = URL_SAFE_NO_PAD.decode(token.trim()) else {
            return false;
        };
        let mut mac = self.keyed.clone();
        mac.update(lead_id.as_bytes());
        mac.verify_slice(&raw).is_ok()
    }

    /// Full link embedded in every message.
    pub fn url(&self, lead_id: &str) -> String {
        format!(
            "{}/unsubscribe?lead={}&token={}",
            self.base_url,
            lead_id,
            self.token(lead_id)
        )
    }
}

impl std::fmt::Debug for UnsubscribeLinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnsubscribeLinks")
            .field("base_url", &self.base_url)
            .field("secret", &"••••")
            .finish()
    }
}
