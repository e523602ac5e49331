//! Signed webhook delivery for postern.
//!
//! Outgoing webhooks carry a JSON envelope `{event, timestamp, data}` and an
//! `X-Webhook-Signature: sha256=<hex>` header computed over the exact body with the
//! endpoint's secret.
//!
//! ## Signing and verifying
//!
//! ```
//! use postern_webhooks::{sign, verify};
//!
//! let body = br#"{"event":"email.sent","timestamp":"2024-05-01T10:00:00Z","data":{}}"#;
//! let signature = sign(body, "whsec_123");
//!
//! assert!(verify(body, &signature, "whsec_123"));
//! assert!(!verify(b"tampered", &signature, "whsec_123"));
//! ```
//!
//! ## Delivering
//!
//! ```no_run
//! use postern_webhooks::{WebhookClient, WebhookConfig, WebhookPayload};
//!
//! # async fn run() -> postern_webhooks::Result<()> {
//! let client = WebhookClient::new(WebhookConfig::default())?;
//! let payload = WebhookPayload::new("email.sent", serde_json::json!({"emailId": 42}));
//!
//! let attempt = client
//!     .deliver("https://hooks.example.com/mail", Some("whsec_123"), &payload)
//!     .await?;
//! println!("delivered: {}", attempt.is_success());
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
mod payload;
mod signature;

pub use client::WebhookClient;
pub use config::WebhookConfig;
pub use error::{Result, WebhookError};
pub use payload::{AttemptStatus, WebhookAttempt, WebhookPayload};
pub use signature::{SIGNATURE_PREFIX, WebhookSignature, headers, sign, verify};

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        WebhookAttempt, WebhookClient, WebhookConfig, WebhookError, WebhookPayload,
        WebhookSignature,
    };
}
