//! Webhook signature generation and verification
//!
//! Signatures are `sha256=<hex HMAC-SHA256(body, secret)>` over the exact request body.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix carried by every signature this crate produces.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Header names used on outgoing webhooks
pub mod headers {
    /// The signature header name
    pub const SIGNATURE: &str = "X-Webhook-Signature";

    /// Event type header
    pub const EVENT_TYPE: &str = "X-Webhook-Event";
}

/// Webhook signature utilities bound to one secret
#[derive(Clone)]
pub struct WebhookSignature {
    secret: String,
}

impl std::fmt::Debug for WebhookSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSignature").finish_non_exhaustive()
    }
}

impl WebhookSignature {
    /// Create a new signature utility with the given secret
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Signature header value for `payload`
    pub fn sign(&self, payload: &[u8]) -> String {
        format!("{}{}", SIGNATURE_PREFIX, hex::encode(self.mac(payload)))
    }

    /// Check a signature. Accepts `sha256=<hex>` or bare hex.
    pub fn verify(&self, payload: &[u8], signature: &str) -> bool {
        let signature = signature.trim();
        let hex_part = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);

        let Ok(provided) = hex::decode(hex_part) else {
            return false;
        };
        constant_time_eq(&provided, &self.mac(payload))
    }

    fn mac(&self, payload: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any length, so this never fails.
        let mut mac = match HmacSha256::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return Vec::new(),
        };
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

/// Sign `payload` with `secret`.
pub fn sign(payload: &[u8], secret: &str) -> String {
    WebhookSignature::new(secret).sign(payload)
}

/// Verify `signature` for `payload` with `secret`.
pub fn verify(payload: &[u8], signature: &str, secret: &str) -> bool {
    WebhookSignature::new(secret).verify(payload, signature)
}

/// Constant-time byte comparison
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() || a.is_empty() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
