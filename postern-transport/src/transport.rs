//! Transport trait shared by every sending backend.

use async_trait::async_trait;

use crate::{DomainVerification, OutboundMessage, Result, SendQuota, SendResult};

/// An outbound mail provider.
///
/// Exactly one implementation is selected at startup (see
/// [`build_transport`](crate::build_transport)); senders only see this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable provider name recorded on sent emails, e.g. `"smtp"` or `"ses"`.
    fn name(&self) -> &'static str;

    /// Send a structured message.
    async fn send_email(&self, message: &OutboundMessage) -> Result<SendResult>;

    /// Send an already encoded MIME message.
    async fn send_raw_email(&self, from: &str, to: &[String], raw: &[u8]) -> Result<SendResult>;

    /// Start verification of a sending domain.
    async fn verify_domain(&self, domain: &str) -> Result<DomainVerification>;

    /// Current verification state of a sending domain.
    async fn check_domain_verification(&self, domain: &str) -> Result<DomainVerification>;

    /// Sending limits.
    async fn get_send_quota(&self) -> Result<SendQuota>;

    /// Check if the transport is healthy.
    async fn is_healthy(&self) -> bool {
        true
    }
}
