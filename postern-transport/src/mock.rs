//! Recording transport for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::time::Instant;

use crate::{
    DomainVerification, OutboundMessage, Result, SendQuota, SendResult, Transport,
    TransportError, VerificationStatus,
};

#[derive(Default)]
struct MockState {
    sent: Vec<OutboundMessage>,
    attempts: Vec<Instant>,
    scripted: VecDeque<String>,
    fail_always: Option<String>,
    healthy: bool,
}

/// Transport that records every send and can be scripted to fail.
///
/// Failures surface as [`TransportError::Smtp`] carrying the scripted text, so
/// their [`ErrorClass`](crate::ErrorClass) follows the usual message patterns.
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A mock that accepts everything.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                healthy: true,
                ..Default::default()
            }),
        }
    }

    /// A mock that rejects every send with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        let mock = Self::new();
        mock.state.lock().fail_always = Some(message.into());
        mock
    }

    /// Fail the next send with `message`. Calls queue up in order.
    pub fn fail_next(&self, message: impl Into<String>) -> &Self {
        self.state.lock().scripted.push_back(message.into());
        self
    }

    /// Set the health check result.
    pub fn set_healthy(&self, healthy: bool) {
        self.state.lock().healthy = healthy;
    }

    /// Messages accepted so far.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.state.lock().sent.clone()
    }

    /// Number of messages accepted.
    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    /// Recipients of every accepted message, in send order.
    pub fn recipients(&self) -> Vec<String> {
        self.state
            .lock()
            .sent
            .iter()
            .flat_map(|msg| msg.recipients().map(str::to_string).collect::<Vec<_>>())
            .collect()
    }

    /// Whether any accepted message went to `address`.
    pub fn was_sent_to(&self, address: &str) -> bool {
        self.state
            .lock()
            .sent
            .iter()
            .any(|msg| msg.recipients().any(|r| r.eq_ignore_ascii_case(address)))
    }

    /// Number of send attempts, successful or not.
    pub fn attempt_count(&self) -> usize {
        self.state.lock().attempts.len()
    }

    /// When each send attempt happened, on the tokio clock.
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.state.lock().attempts.clone()
    }

    /// Forget everything recorded.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.sent.clear();
        state.attempts.clear();
    }

    fn attempt(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.attempts.push(Instant::now());
        if let Some(message) = state.scripted.pop_front() {
            return Err(TransportError::Smtp(message));
        }
        if let Some(message) = &state.fail_always {
            return Err(TransportError::Smtp(message.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn send_email(&self, message: &OutboundMessage) -> Result<SendResult> {
        self.attempt()?;
        message.validate()?;

        let mut state = self.state.lock();
        state.sent.push(message.clone());
        Ok(SendResult {
            message_id: format!("mock-{}", state.sent.len()),
            provider: "mock".to_string(),
        })
    }

    async fn send_raw_email(&self, from: &str, to: &[String], raw: &[u8]) -> Result<SendResult> {
        self.attempt()?;

        let mut message = OutboundMessage::new(from, "").text(String::from_utf8_lossy(raw));
        message.to = to.to_vec();

        let mut state = self.state.lock();
        state.sent.push(message);
        Ok(SendResult {
            message_id: format!("mock-{}", state.sent.len()),
            provider: "mock".to_string(),
        })
    }

    async fn verify_domain(&self, domain: &str) -> Result<DomainVerification> {
        Ok(DomainVerification {
            domain: domain.to_string(),
            dkim_tokens: vec!["mock1".into(), "mock2".into(), "mock3".into()],
            status: VerificationStatus::Pending,
            mail_from_domain: None,
        })
    }

    async fn check_domain_verification(&self, domain: &str) -> Result<DomainVerification> {
        Ok(DomainVerification {
            status: VerificationStatus::Verified,
            ..self.verify_domain(domain).await?
        })
    }

    async fn get_send_quota(&self) -> Result<SendQuota> {
        let sent = self.sent_count() as f64;
        Ok(SendQuota {
            sent_last_24h: sent,
            ..Default::default()
        })
    }

    async fn is_healthy(&self) -> bool {
        self.state.lock().healthy
    }
}
