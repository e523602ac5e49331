//! Configuration for webhook client

use std::time::Duration;

/// Configuration for the webhook client
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Timeout for a single delivery attempt
    pub timeout: Duration,

    /// User-Agent header for outgoing requests
    pub user_agent: String,

    /// Maximum payload size in bytes
    pub max_payload_size: usize,

    /// How much of a failed response body is kept
    pub max_response_body: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("postern-webhooks/{}", env!("CARGO_PKG_VERSION")),
            max_payload_size: 1024 * 1024,
            max_response_body: 1024,
        }
    }
}

impl WebhookConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the User-Agent header
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set maximum payload size
    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WebhookConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.user_agent.starts_with("postern-webhooks/"));
        assert_eq!(config.max_response_body, 1024);
    }
}
