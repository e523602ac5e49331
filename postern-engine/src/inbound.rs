//! Provider notification intake.
//!
//! Mail providers report what happened after a hand-off (bounces, complaints,
//! deliveries, opens) through signed notification envelopes posted to
//! `POST /webhooks/provider/incoming?secret=<token>`. [`InboundHandler::handle`] is the
//! framework-agnostic body of that endpoint: give it the `secret` query value and the
//! raw request body and send back the returned [`InboundResponse`].
//!
//! Every envelope is authenticated before it is acted on:
//!
//! 1. the `SigningCertURL` must pass the URL check (by default
//!    `https://sns.<region>.amazonaws.com/...`),
//! 2. the certificate is fetched once per URL and cached,
//! 3. the base64 `Signature` is verified over the canonical string with RSA-SHA1
//!    (`SignatureVersion` 1) or RSA-SHA256 (`SignatureVersion` 2).
//!
//! Anything that fails parsing or verification is logged and acknowledged with `200`
//! so the provider does not redeliver it. Only a wrong shared secret is refused; with
//! no secret configured the query check is skipped and signatures alone decide.

use async_trait::async_trait;
use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use dashmap::DashMap;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Public};
use openssl::sign::Verifier;
use openssl::x509::X509;
use postern_queue::Queue;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::InboundConfig;
use crate::error::{EngineError, Result};
use crate::model::{ContactStatus, Email, EmailStatus, EventKind, SuppressionSource};
use crate::store::DeliveryStore;
use crate::suppression::{self, REASON_COMPLAINT, REASON_HARD_BOUNCE};
use crate::webhook_worker::{self, events};

/// Decides whether a certificate or subscription URL may be fetched.
pub type UrlCheck = Arc<dyn Fn(&Url) -> bool + Send + Sync>;

/// Status and body to send back to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundResponse {
    pub status: u16,
    pub body: String,
}

impl InboundResponse {
    fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    fn forbidden() -> Self {
        Self {
            status: 403,
            body: "forbidden".into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Receives inbound mail (`Received` events). Parsing and storing it is up to the
/// implementation.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn receive(&self, event: &ProviderEvent, raw: &str) -> Result<()>;
}

/// Signed notification envelope.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Envelope {
    #[serde(rename = "Type")]
    pub kind: String,
    pub message_id: String,
    pub topic_arn: String,
    pub subject: Option<String>,
    pub message: String,
    pub timestamp: String,
    pub signature_version: String,
    pub signature: String,
    #[serde(rename = "SigningCertURL")]
    pub signing_cert_url: String,
    #[serde(rename = "SubscribeURL")]
    pub subscribe_url: Option<String>,
    #[serde(rename = "UnsubscribeURL")]
    pub unsubscribe_url: Option<String>,
    pub token: Option<String>,
}

impl Envelope {
    /// The string the provider signed.
    pub fn canonical_string(&self) -> Result<String> {
        let mut fields = vec![
            ("Message", self.message.as_str()),
            ("MessageId", self.message_id.as_str()),
        ];
        match self.kind.as_str() {
            "Notification" => {
                if let Some(subject) = &self.subject {
                    fields.push(("Subject", subject.as_str()));
                }
                fields.extend([
                    ("Timestamp", self.timestamp.as_str()),
                    ("TopicArn", self.topic_arn.as_str()),
                ]);
            }
            "SubscriptionConfirmation" | "UnsubscribeConfirmation" => {
                fields.extend([
                    ("SubscribeURL", self.subscribe_url.as_deref().unwrap_or_default()),
                    ("Timestamp", self.timestamp.as_str()),
                    ("Token", self.token.as_deref().unwrap_or_default()),
                    ("TopicArn", self.topic_arn.as_str()),
                ]);
            }
            other => {
                return Err(EngineError::InvalidNotification(format!(
                    "unknown envelope type {:?}",
                    other
                )));
            }
        }
        fields.push(("Type", self.kind.as_str()));

        Ok(fields
            .into_iter()
            .map(|(key, value)| format!("{}\n{}\n", key, value))
            .collect())
    }

    fn digest(&self) -> Result<MessageDigest> {
        match self.signature_version.as_str() {
            "1" => Ok(MessageDigest::sha1()),
            "2" => Ok(MessageDigest::sha256()),
            other => Err(EngineError::InvalidNotification(format!(
                "unsupported signature version {:?}",
                other
            ))),
        }
    }
}

/// Provider event carried in an envelope's `Message`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderEvent {
    #[serde(alias = "eventType")]
    pub notification_type: String,
    pub mail: MailInfo,
    pub bounce: Option<BounceInfo>,
    pub complaint: Option<ComplaintInfo>,
    pub delivery: Option<DeliveryInfo>,
    pub reject: Option<RejectInfo>,
    pub delivery_delay: Option<DelayInfo>,
    pub open: Option<OpenInfo>,
    pub click: Option<ClickInfo>,
    /// Raw MIME for `Received` events published with content.
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MailInfo {
    pub message_id: String,
    pub source: String,
    pub destination: Vec<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BounceInfo {
    pub bounce_type: String,
    pub bounce_sub_type: String,
    pub bounced_recipients: Vec<Recipient>,
}

impl BounceInfo {
    pub fn is_permanent(&self) -> bool {
        self.bounce_type == "Permanent"
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Recipient {
    pub email_address: String,
    pub diagnostic_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComplaintInfo {
    pub complained_recipients: Vec<Recipient>,
    pub complaint_feedback_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryInfo {
    pub recipients: Vec<String>,
    pub processing_time_millis: i64,
    pub smtp_response: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RejectInfo {
    pub reason: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DelayInfo {
    pub delay_type: String,
    pub expiration_time: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OpenInfo {
    pub ip_address: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClickInfo {
    pub link: String,
    pub ip_address: String,
    pub user_agent: String,
}

/// Default URL check: `https://sns.<region>.amazonaws.com/...`.
pub fn is_provider_url(url: &Url) -> bool {
    url.scheme() == "https"
        && url
            .host_str()
            .is_some_and(|host| host.starts_with("sns.") && host.ends_with(".amazonaws.com"))
}

/// Verifies provider notifications and applies them to the store.
pub struct InboundHandler {
    store: Arc<dyn DeliveryStore>,
    queue: Queue,
    config: InboundConfig,
    http: reqwest::Client,
    certs: DashMap<String, PKey<Public>>,
    url_check: UrlCheck,
    sink: Option<Arc<dyn InboundSink>>,
}

impl InboundHandler {
    pub fn new(store: Arc<dyn DeliveryStore>, queue: Queue, config: InboundConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self {
            store,
            queue,
            config,
            http,
            certs: DashMap::new(),
            url_check: Arc::new(is_provider_url),
            sink: None,
        })
    }

    /// Replace the certificate and subscription URL check.
    pub fn with_url_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&Url) -> bool + Send + Sync + 'static,
    {
        self.url_check = Arc::new(check);
        self
    }

    /// Hand `Received` events to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn InboundSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Handle one callback request.
    pub async fn handle(&self, query_secret: Option<&str>, body: &[u8]) -> InboundResponse {
        if let Some(expected) = &self.config.shared_secret {
            let given = query_secret.unwrap_or_default();
            if !secrets_match(expected, given) {
                warn!("Provider callback with missing or wrong secret");
                return InboundResponse::forbidden();
            }
        }

        let envelope: Envelope = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Malformed provider notification, dropping");
                return InboundResponse::ok("ignored");
            }
        };

        if let Err(e) = self.verify(&envelope).await {
            warn!(
                message_id = %envelope.message_id,
                kind = %envelope.kind,
                error = %e,
                "Provider notification failed verification, dropping"
            );
            return InboundResponse::ok("ignored");
        }

        match envelope.kind.as_str() {
            "SubscriptionConfirmation" => {
                if let Err(e) = self.confirm(&envelope).await {
                    warn!(topic = %envelope.topic_arn, error = %e, "Subscription confirmation failed");
                    return InboundResponse::ok("ignored");
                }
                InboundResponse::ok("subscription confirmed")
            }
            "UnsubscribeConfirmation" => {
                info!(topic = %envelope.topic_arn, "Provider topic unsubscribed");
                InboundResponse::ok("ok")
            }
            "Notification" => {
                if let Err(e) = self.notify(&envelope.message).await {
                    warn!(message_id = %envelope.message_id, error = %e, "Failed to apply provider event");
                }
                InboundResponse::ok("ok")
            }
            other => {
                debug!(kind = other, "Ignoring provider envelope");
                InboundResponse::ok("ignored")
            }
        }
    }

    /// Check the envelope's signature against its signing certificate.
    pub async fn verify(&self, envelope: &Envelope) -> Result<()> {
        let canonical = envelope.canonical_string()?;
        let digest = envelope.digest()?;
        let signature = BASE64_STANDARD.decode(envelope.signature.trim())?;
        let key = self.signing_key(&envelope.signing_cert_url).await?;

        let mut verifier = Verifier::new(digest, &key)?;
        if verifier.verify_oneshot(&signature, canonical.as_bytes())? {
            Ok(())
        } else {
            Err(EngineError::InvalidNotification("signature mismatch".into()))
        }
    }

    async fn signing_key(&self, cert_url: &str) -> Result<PKey<Public>> {
        if let Some(key) = self.certs.get(cert_url) {
            return Ok(key.clone());
        }

        let url = self.checked_url(cert_url)?;
        let pem = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let key = X509::from_pem(&pem)?.public_key()?;

        debug!(cert_url, "Cached provider signing certificate");
        self.certs.insert(cert_url.to_string(), key.clone());
        Ok(key)
    }

    fn checked_url(&self, raw: &str) -> Result<Url> {
        let url = Url::parse(raw)?;
        if !(self.url_check)(&url) {
            return Err(EngineError::InvalidNotification(format!(
                "untrusted url {}",
                raw
            )));
        }
        Ok(url)
    }

    async fn confirm(&self, envelope: &Envelope) -> Result<()> {
        if !self.config.confirm_subscriptions {
            info!(topic = %envelope.topic_arn, "Subscription confirmation disabled, not confirming");
            return Ok(());
        }
        let raw = envelope
            .subscribe_url
            .as_deref()
            .ok_or_else(|| EngineError::InvalidNotification("missing SubscribeURL".into()))?;
        let url = self.checked_url(raw)?;

        self.http.get(url).send().await?.error_for_status()?;
        info!(topic = %envelope.topic_arn, "Provider subscription confirmed");
        Ok(())
    }

    /// Apply a verified provider event.
    pub async fn notify(&self, message: &str) -> Result<()> {
        let event: ProviderEvent = serde_json::from_str(message)?;
        let kind = event.notification_type.as_str();

        if kind == "Received" {
            return match &self.sink {
                Some(sink) => sink.receive(&event, message).await,
                None => {
                    debug!(message_id = %event.mail.message_id, "No inbound sink, dropping received mail");
                    Ok(())
                }
            };
        }
        if kind == "Send" {
            return Ok(());
        }

        let Some(email) = self
            .store
            .find_email_by_provider_id(&event.mail.message_id)
            .await?
        else {
            debug!(message_id = %event.mail.message_id, kind, "Provider event for unknown email");
            return Ok(());
        };

        match kind {
            "Bounce" => self.on_bounce(&email, event.bounce.unwrap_or_default()).await,
            "Complaint" => {
                self.on_complaint(&email, event.complaint.unwrap_or_default())
                    .await
            }
            "Delivery" => {
                self.on_delivery(&email, event.delivery.unwrap_or_default())
                    .await
            }
            "Reject" => {
                let reject = event.reject.unwrap_or_default();
                self.settle(&email, EmailStatus::Failed).await?;
                self.store
                    .append_event(email.id, EventKind::Rejected, Some(&reject.reason))
                    .await
            }
            "DeliveryDelay" => {
                let delay = event.delivery_delay.unwrap_or_default();
                let detail = format!(
                    "Delivery delayed: {} (expires: {})",
                    delay.delay_type, delay.expiration_time
                );
                self.store
                    .append_event(email.id, EventKind::Deferred, Some(&detail))
                    .await
            }
            "Open" => {
                self.store
                    .append_event(email.id, EventKind::Opened, None)
                    .await
            }
            "Click" => {
                let click = event.click.unwrap_or_default();
                let detail = format!("Link clicked: {}", click.link);
                self.store
                    .append_event(email.id, EventKind::Clicked, Some(&detail))
                    .await
            }
            other => {
                debug!(kind = other, "Ignoring provider event");
                Ok(())
            }
        }
    }

    async fn on_bounce(&self, email: &Email, bounce: BounceInfo) -> Result<()> {
        let detail = format!("{}/{}", bounce.bounce_type, bounce.bounce_sub_type);
        if !bounce.is_permanent() {
            return self
                .store
                .append_event(email.id, EventKind::Deferred, Some(&detail))
                .await;
        }

        let recipients: Vec<&str> = bounce
            .bounced_recipients
            .iter()
            .map(|r| r.email_address.as_str())
            .collect();
        suppression::suppress_all(
            self.store.as_ref(),
            email.org_id,
            recipients.iter().copied(),
            REASON_HARD_BOUNCE,
            SuppressionSource::Bounce,
        )
        .await?;
        for recipient in &recipients {
            self.store
                .set_contact_status(email.org_id, recipient, ContactStatus::Bounced)
                .await?;
        }

        self.settle(email, EmailStatus::Bounced).await?;
        self.store
            .append_event(email.id, EventKind::Bounced, Some(&detail))
            .await?;
        info!(email_id = email.id, recipients = recipients.len(), "Hard bounce recorded");

        self.publish(
            email,
            events::EMAIL_BOUNCED,
            json!({
                "emailId": email.id,
                "recipients": recipients,
                "bounceType": bounce.bounce_type,
                "bounceSubType": bounce.bounce_sub_type,
            }),
        )
        .await;
        Ok(())
    }

    async fn on_complaint(&self, email: &Email, complaint: ComplaintInfo) -> Result<()> {
        let recipients: Vec<&str> = complaint
            .complained_recipients
            .iter()
            .map(|r| r.email_address.as_str())
            .collect();
        suppression::suppress_all(
            self.store.as_ref(),
            email.org_id,
            recipients.iter().copied(),
            REASON_COMPLAINT,
            SuppressionSource::Complaint,
        )
        .await?;
        for recipient in &recipients {
            self.store
                .set_contact_status(email.org_id, recipient, ContactStatus::Complained)
                .await?;
        }

        let feedback = complaint.complaint_feedback_type.unwrap_or_default();
        self.settle(email, EmailStatus::Complained).await?;
        self.store
            .append_event(
                email.id,
                EventKind::Complained,
                Some(&format!("Complaint: {}", feedback)),
            )
            .await?;
        info!(email_id = email.id, recipients = recipients.len(), "Complaint recorded");

        self.publish(
            email,
            events::EMAIL_COMPLAINED,
            json!({
                "emailId": email.id,
                "recipients": recipients,
                "feedbackType": feedback,
            }),
        )
        .await;
        Ok(())
    }

    async fn on_delivery(&self, email: &Email, delivery: DeliveryInfo) -> Result<()> {
        let detail = format!(
            "Delivered to {} in {}ms",
            delivery.recipients.join(", "),
            delivery.processing_time_millis
        );
        self.settle(email, EmailStatus::Delivered).await?;
        self.store
            .append_event(email.id, EventKind::Delivered, Some(&detail))
            .await?;

        self.publish(
            email,
            events::EMAIL_DELIVERED,
            json!({
                "emailId": email.id,
                "recipients": delivery.recipients,
                "smtpResponse": delivery.smtp_response,
            }),
        )
        .await;
        Ok(())
    }

    /// Move an email to a provider-reported status unless that would undo a bounce
    /// or complaint. The event is still recorded by the caller.
    async fn settle(&self, email: &Email, status: EmailStatus) -> Result<()> {
        if overrides_outcome(email.status, status) {
            debug!(email_id = email.id, current = %email.status, reported = %status, "Keeping final provider status");
            return Ok(());
        }
        self.store.set_email_status(email.id, status).await
    }

    async fn publish(&self, email: &Email, event: &str, data: serde_json::Value) {
        if let Err(e) = webhook_worker::dispatch(
            self.store.as_ref(),
            &self.queue,
            email.org_id,
            event,
            Some(email.id),
            data,
        )
        .await
        {
            warn!(email_id = email.id, event, error = %e, "Failed to enqueue webhooks");
        }
    }
}

/// Whether `next` would replace a bounce or complaint already on record. A
/// complaint outranks a bounce.
fn overrides_outcome(current: EmailStatus, next: EmailStatus) -> bool {
    match current {
        EmailStatus::Complained => next != EmailStatus::Complained,
        EmailStatus::Bounced => !matches!(next, EmailStatus::Bounced | EmailStatus::Complained),
        _ => false,
    }
}

fn secrets_match(expected: &str, given: &str) -> bool {
    expected.len() == given.len() && openssl::memcmp::eq(expected.as_bytes(), given.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounce_and_complaint_are_not_overridden() {
        use EmailStatus::*;
        assert!(overrides_outcome(Bounced, Delivered));
        assert!(overrides_outcome(Bounced, Failed));
        assert!(!overrides_outcome(Bounced, Complained));
        assert!(overrides_outcome(Complained, Bounced));
        assert!(overrides_outcome(Complained, Delivered));
        assert!(!overrides_outcome(Sent, Delivered));
        assert!(!overrides_outcome(Delivered, Bounced));
    }

    fn envelope(kind: &str) -> Envelope {
        Envelope {
            kind: kind.into(),
            message_id: "m-1".into(),
            topic_arn: "arn:aws:sns:us-east-1:1:ses".into(),
            message: "hello".into(),
            timestamp: "2024-03-01T09:00:00.000Z".into(),
            subscribe_url: Some("https://sns.us-east-1.amazonaws.com/?Action=Confirm".into()),
            token: Some("tok".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_notification_canonical_string() {
        let mut env = envelope("Notification");
        assert_eq!(
            env.canonical_string().unwrap(),
            "Message\nhello\nMessageId\nm-1\nTimestamp\n2024-03-01T09:00:00.000Z\n\
             TopicArn\narn:aws:sns:us-east-1:1:ses\nType\nNotification\n"
        );

        env.subject = Some("Amazon SES Email Event".into());
        assert!(
            env.canonical_string()
                .unwrap()
                .contains("MessageId\nm-1\nSubject\nAmazon SES Email Event\nTimestamp\n")
        );
    }

    #[test]
    fn test_subscription_canonical_string() {
        let env = envelope("SubscriptionConfirmation");
        assert_eq!(
            env.canonical_string().unwrap(),
            "Message\nhello\nMessageId\nm-1\n\
             SubscribeURL\nhttps://sns.us-east-1.amazonaws.com/?Action=Confirm\n\
             Timestamp\n2024-03-01T09:00:00.000Z\nToken\ntok\n\
             TopicArn\narn:aws:sns:us-east-1:1:ses\nType\nSubscriptionConfirmation\n"
        );
        assert!(envelope("Bogus").canonical_string().is_err());
    }

    #[test]
    fn test_provider_url_check() {
        let ok = |s: &str| is_provider_url(&Url::parse(s).unwrap());
        assert!(ok("https://sns.eu-west-1.amazonaws.com/SimpleNotificationService-1.pem"));
        assert!(!ok("http://sns.eu-west-1.amazonaws.com/cert.pem"));
        assert!(!ok("https://sns.eu-west-1.amazonaws.com.evil.test/cert.pem"));
        assert!(!ok("https://evil.test/sns.amazonaws.com"));
    }

    #[test]
    fn test_signature_versions() {
        let mut env = envelope("Notification");
        env.signature_version = "1".into();
        assert!(env.digest().is_ok());
        env.signature_version = "2".into();
        assert!(env.digest().is_ok());
        env.signature_version = "3".into();
        assert!(env.digest().is_err());
    }

    #[test]
    fn test_provider_event_parsing() {
        let event: ProviderEvent = serde_json::from_str(
            r#"{"notificationType":"Bounce","mail":{"messageId":"abc","destination":["a@x.test"]},
                "bounce":{"bounceType":"Permanent","bounceSubType":"General",
                "bouncedRecipients":[{"emailAddress":"a@x.test","diagnosticCode":"550"}]}}"#,
        )
        .unwrap();
        assert_eq!(event.mail.message_id, "abc");
        assert!(event.bounce.unwrap().is_permanent());
    }
}
