//! Outbound message and provider result types.

use crate::{Result, TransportError};
use lettre::message::header::{HeaderName, HeaderValue};
use lettre::message::{Mailbox, MultiPart, SinglePart, header::ContentType};
use serde::{Deserialize, Serialize};

/// A fully rendered message ready for a transport.
///
/// Addresses may be bare (`a@example.com`) or carry a display name
/// (`Ada <a@example.com>`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Sender.
    pub from: String,
    /// To recipients.
    pub to: Vec<String>,
    /// CC recipients.
    #[serde(default)]
    pub cc: Vec<String>,
    /// BCC recipients.
    #[serde(default)]
    pub bcc: Vec<String>,
    /// Reply-to address.
    pub reply_to: Option<String>,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub text_body: Option<String>,
    /// HTML body.
    pub html_body: Option<String>,
    /// RFC 5322 Message-ID, including angle brackets.
    pub message_id: Option<String>,
    /// Extra headers, in order.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl OutboundMessage {
    /// Create a message with a sender and subject.
    pub fn new(from: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            subject: subject.into(),
            ..Default::default()
        }
    }

    /// Add a to recipient.
    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to.push(to.into());
        self
    }

    /// Add a CC recipient.
    pub fn cc(mut self, cc: impl Into<String>) -> Self {
        self.cc.push(cc.into());
        self
    }

    /// Add a BCC recipient.
    pub fn bcc(mut self, bcc: impl Into<String>) -> Self {
        self.bcc.push(bcc.into());
        self
    }

    /// Set the reply-to address.
    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Set the plain text body.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text_body = Some(text.into());
        self
    }

    /// Set the HTML body.
    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html_body = Some(html.into());
        self
    }

    /// Set the message ID.
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Add a custom header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Look up a custom header, ignoring case.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every envelope recipient: to, cc and bcc.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(String::as_str)
    }

    /// Domain part of the sender address.
    pub fn from_domain(&self) -> Option<&str> {
        let addr = match (self.from.find('<'), self.from.rfind('>')) {
            (Some(start), Some(end)) if start < end => &self.from[start + 1..end],
            _ => self.from.as_str(),
        };
        addr.rsplit_once('@')
            .map(|(_, domain)| domain.trim())
            .filter(|domain| !domain.is_empty())
    }

    /// Validate the message.
    pub fn validate(&self) -> Result<()> {
        if self.from.trim().is_empty() {
            return Err(TransportError::MissingField("from"));
        }
        if self.recipients().next().is_none() {
            return Err(TransportError::MissingField("to/cc/bcc"));
        }
        if self.text_body.is_none() && self.html_body.is_none() {
            return Err(TransportError::MissingField("text/html body"));
        }
        Ok(())
    }

    /// Build a lettre message.
    pub(crate) fn to_lettre(&self) -> Result<lettre::Message> {
        self.validate()?;

        let mut builder = lettre::Message::builder()
            .from(parse_mailbox(&self.from)?)
            .subject(self.subject.as_str());

        for addr in &self.to {
            builder = builder.to(parse_mailbox(addr)?);
        }
        for addr in &self.cc {
            builder = builder.cc(parse_mailbox(addr)?);
        }
        for addr in &self.bcc {
            builder = builder.bcc(parse_mailbox(addr)?);
        }
        if let Some(reply_to) = &self.reply_to {
            builder = builder.reply_to(parse_mailbox(reply_to)?);
        }
        if let Some(message_id) = &self.message_id {
            builder = builder.message_id(Some(message_id.clone()));
        }

        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("Message-ID") {
                continue;
            }
            let header_name = HeaderName::new_from_ascii(name.clone())
                .map_err(|_| TransportError::InvalidMessage(format!("bad header name '{}'", name)))?;
            builder = builder.raw_header(HeaderValue::new(header_name, value.clone()));
        }

        let message = match (&self.text_body, &self.html_body) {
            (Some(text), Some(html)) => builder.multipart(MultiPart::alternative_plain_html(
                text.clone(),
                html.clone(),
            ))?,
            (None, Some(html)) => builder.singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_HTML)
                    .body(html.clone()),
            )?,
            (Some(text), None) => builder.singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_PLAIN)
                    .body(text.clone()),
            )?,
            (None, None) => return Err(TransportError::MissingField("text/html body")),
        };

        Ok(message)
    }
}

pub(crate) fn parse_mailbox(addr: &str) -> Result<Mailbox> {
    addr.trim()
        .parse()
        .map_err(|_| TransportError::InvalidAddress(addr.to_string()))
}

/// Outcome of a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    /// Provider-assigned message id, or the message's own Message-ID over SMTP.
    pub message_id: String,
    /// Transport that accepted the message.
    pub provider: String,
}

/// Verification state of a sending domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    NotStarted,
    Pending,
    Verified,
    Failed,
}

/// DNS material and state for a sending domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainVerification {
    pub domain: String,
    /// DKIM selector tokens; each becomes `<token>._domainkey.<domain>` CNAME.
    pub dkim_tokens: Vec<String>,
    pub status: VerificationStatus,
    /// Custom MAIL FROM subdomain, when configured.
    pub mail_from_domain: Option<String>,
}

impl DomainVerification {
    /// DKIM CNAME records as `(name, value)` pairs.
    pub fn dkim_records(&self) -> Vec<(String, String)> {
        self.dkim_tokens
            .iter()
            .map(|token| {
                (
                    format!("{}._domainkey.{}", token, self.domain),
                    format!("{}.dkim.amazonses.com", token),
                )
            })
            .collect()
    }
}

/// Provider sending limits. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SendQuota {
    pub max_24h_send: f64,
    pub max_send_rate: f64,
    pub sent_last_24h: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboundMessage {
        OutboundMessage::new("Acme <news@acme.test>", "Hello")
            .to("ada@example.com")
            .html("<p>Hi</p>")
            .text("Hi")
            .message_id("<abc@acme.test>")
            .header("List-Unsubscribe", "<https://api.acme.test/u/1>")
    }

    #[test]
    fn test_validate() {
        assert!(message().validate().is_ok());

        let missing_body = OutboundMessage::new("a@acme.test", "x").to("b@example.com");
        assert!(matches!(
            missing_body.validate(),
            Err(TransportError::MissingField("text/html body"))
        ));

        let no_recipients = OutboundMessage::new("a@acme.test", "x").text("hi");
        assert!(no_recipients.validate().is_err());
    }

    #[test]
    fn test_from_domain() {
        assert_eq!(message().from_domain(), Some("acme.test"));
        assert_eq!(OutboundMessage::new("bare@mail.test", "").from_domain(), Some("mail.test"));
        assert_eq!(OutboundMessage::new("nobody", "").from_domain(), None);
    }

    #[test]
    fn test_to_lettre_carries_headers() {
        let formatted = String::from_utf8(message().to_lettre().unwrap().formatted()).unwrap();
        assert!(formatted.contains("Message-ID: <abc@acme.test>"));
        assert!(formatted.contains("List-Unsubscribe: <https://api.acme.test/u/1>"));
        assert!(formatted.contains("Subject: Hello"));
    }

    #[test]
    fn test_invalid_address() {
        let msg = OutboundMessage::new("a@acme.test", "x").to("not an address").text("hi");
        assert!(matches!(msg.to_lettre(), Err(TransportError::InvalidAddress(_))));
    }

    #[test]
    fn test_recipients_and_header_lookup() {
        let msg = message().cc("c@example.com").bcc("d@example.com");
        assert_eq!(msg.recipients().count(), 3);
        assert!(msg.header_value("list-unsubscribe").is_some());
    }

    #[test]
    fn test_dkim_records() {
        let verification = DomainVerification {
            domain: "acme.test".into(),
            dkim_tokens: vec!["tok1".into()],
            status: VerificationStatus::Pending,
            mail_from_domain: None,
        };
        assert_eq!(
            verification.dkim_records(),
            vec![("tok1._domainkey.acme.test".to_string(), "tok1.dkim.amazonses.com".to_string())]
        );
    }
}
