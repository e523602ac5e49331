//! Webhook client for sending outgoing webhooks

use crate::signature::headers;
use crate::{
    AttemptStatus, Result, WebhookAttempt, WebhookConfig, WebhookError, WebhookPayload,
    WebhookSignature,
};
use reqwest::Client;
use std::time::Instant;
use tracing::{debug, warn};
use url::Url;

/// Client for webhook deliveries. Each call is exactly one attempt; retry policy
/// belongs to the caller.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    config: WebhookConfig,
    http_client: Client,
}

impl WebhookClient {
    /// Create a new webhook client
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// POST `payload` to `url`, signing the body when a secret is given.
    ///
    /// Network failures and non-2xx responses come back as a failed
    /// [`WebhookAttempt`]; only problems with the request itself are errors.
    pub async fn deliver(
        &self,
        url: &str,
        secret: Option<&str>,
        payload: &WebhookPayload,
    ) -> Result<WebhookAttempt> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(WebhookError::Config(format!(
                "unsupported webhook scheme '{}'",
                url.scheme()
            )));
        }

        let body = payload.to_bytes()?;
        if body.len() > self.config.max_payload_size {
            return Err(WebhookError::PayloadTooLarge {
                size: body.len(),
                max: self.config.max_payload_size,
            });
        }

        let mut request = self
            .http_client
            .post(url.clone())
            .header("Content-Type", "application/json")
            .header(headers::EVENT_TYPE, &payload.event);

        if let Some(secret) = secret.filter(|s| !s.is_empty()) {
            request = request.header(headers::SIGNATURE, WebhookSignature::new(secret).sign(&body));
        }

        debug!(url = %url, event = %payload.event, bytes = body.len(), "Delivering webhook");

        let started = Instant::now();
        let response = request.body(body).send().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let attempt = match response {
            Ok(response) if response.status().is_success() => WebhookAttempt {
                status: AttemptStatus::Success,
                status_code: Some(response.status().as_u16()),
                response_body: None,
                error: None,
                duration_ms,
            },
            Ok(response) => {
                let code = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                let text = truncate(&text, self.config.max_response_body).to_string();
                WebhookAttempt {
                    status: AttemptStatus::Failed,
                    status_code: Some(code),
                    error: Some(format!("HTTP {}: {}", code, text)),
                    response_body: Some(text),
                    duration_ms,
                }
            }
            Err(e) => WebhookAttempt {
                status: AttemptStatus::Error,
                status_code: None,
                response_body: None,
                error: Some(e.to_string()),
                duration_ms,
            },
        };

        if !attempt.is_success() {
            warn!(
                url = %url,
                event = %payload.event,
                status_code = ?attempt.status_code,
                error = ?attempt.error,
                "Webhook delivery attempt failed"
            );
        }

        Ok(attempt)
    }

    /// Get the configuration
    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_client_creation() {
        let client = WebhookClient::new(WebhookConfig::default()).unwrap();
        assert_eq!(client.config().timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        assert_eq!(truncate("héllo", 2), "h");
    }

    #[tokio::test]
    async fn test_payload_too_large() {
        let client =
            WebhookClient::new(WebhookConfig::default().with_max_payload_size(10)).unwrap();
        let payload = WebhookPayload::new(
            "email.sent",
            serde_json::json!({"large": "This is definitely more than 10 bytes"}),
        );

        let result = client.deliver("http://localhost:9999/hook", None, &payload).await;
        assert!(matches!(result, Err(WebhookError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_rejects_non_http_url() {
        let client = WebhookClient::new(WebhookConfig::default()).unwrap();
        let payload = WebhookPayload::new("email.sent", serde_json::json!({}));

        assert!(client.deliver("ftp://example.com/x", None, &payload).await.is_err());
        assert!(matches!(
            client.deliver("not a url", None, &payload).await,
            Err(WebhookError::InvalidUrl(_))
        ));
    }
}
