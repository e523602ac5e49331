//! AWS SES (v2 API) transport.

use async_trait::async_trait;
use aws_sdk_sesv2::{
    Client,
    primitives::Blob,
    types::{
        Body, Content, Destination, DkimSigningAttributes, DkimSigningKeyLength, EmailContent,
        Message, MessageHeader, RawMessage,
    },
};
use tracing::{debug, warn};

use crate::{
    DomainVerification, OutboundMessage, Result, SendQuota, SendResult, SesConfig, Transport,
    TransportError, VerificationStatus,
};

fn content(data: &str) -> Result<Content> {
    Content::builder()
        .data(data)
        .charset("UTF-8")
        .build()
        .map_err(|e| TransportError::InvalidMessage(e.to_string()))
}

fn provider_error(err: impl std::error::Error) -> TransportError {
    // SDK errors only show their cause chain through the source list.
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    TransportError::Provider(message)
}

/// AWS SES transport.
pub struct SesTransport {
    client: Client,
    config: SesConfig,
}

impl SesTransport {
    /// Create a new SES transport from the default AWS credential chain.
    pub async fn new(config: SesConfig) -> Result<Self> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

        let mut builder = aws_sdk_sesv2::config::Builder::from(&aws_config);
        if let Some(region) = &config.region {
            builder = builder.region(aws_sdk_sesv2::config::Region::new(region.clone()));
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            config,
        })
    }

    /// Create from an existing AWS SDK client.
    pub fn from_client(client: Client, config: SesConfig) -> Self {
        Self { client, config }
    }

    fn mail_from_domain(&self, domain: &str) -> Option<String> {
        self.config
            .mail_from_subdomain
            .as_ref()
            .map(|sub| format!("{}.{}", sub, domain))
    }

    async fn identity(&self, domain: &str) -> Result<DomainVerification> {
        let identity = self
            .client
            .get_email_identity()
            .email_identity(domain)
            .send()
            .await
            .map_err(provider_error)?;

        let status = if identity.verified_for_sending_status() {
            VerificationStatus::Verified
        } else {
            match identity.verification_status() {
                Some(aws_sdk_sesv2::types::VerificationStatus::Failed) => VerificationStatus::Failed,
                Some(aws_sdk_sesv2::types::VerificationStatus::NotStarted) => {
                    VerificationStatus::NotStarted
                }
                _ => VerificationStatus::Pending,
            }
        };

        Ok(DomainVerification {
            domain: domain.to_string(),
            dkim_tokens: identity
                .dkim_attributes()
                .map(|dkim| dkim.tokens().to_vec())
                .unwrap_or_default(),
            status,
            mail_from_domain: identity
                .mail_from_attributes()
                .map(|attrs| attrs.mail_from_domain().to_string()),
        })
    }
}

#[async_trait]
impl Transport for SesTransport {
    fn name(&self) -> &'static str {
        "ses"
    }

    async fn send_email(&self, message: &OutboundMessage) -> Result<SendResult> {
        message.validate()?;

        debug!(
            to = ?message.to,
            subject = %message.subject,
            "Sending email via AWS SES"
        );

        let destination = Destination::builder()
            .set_to_addresses(Some(message.to.clone()))
            .set_cc_addresses(Some(message.cc.clone()))
            .set_bcc_addresses(Some(message.bcc.clone()))
            .build();

        let mut body = Body::builder();
        if let Some(text) = &message.text_body {
            body = body.text(content(text)?);
        }
        if let Some(html) = &message.html_body {
            body = body.html(content(html)?);
        }

        let mut simple = Message::builder()
            .subject(content(&message.subject)?)
            .body(body.build());

        // SES assigns its own Message-ID in the simple format.
        for (name, value) in &message.headers {
            if name.eq_ignore_ascii_case("Message-ID") {
                continue;
            }
            let header = MessageHeader::builder()
                .name(name)
                .value(value)
                .build()
                .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
            simple = simple.headers(header);
        }

        let mut request = self
            .client
            .send_email()
            .from_email_address(&message.from)
            .destination(destination)
            .content(EmailContent::builder().simple(simple.build()).build());

        if let Some(config_set) = &self.config.configuration_set {
            request = request.configuration_set_name(config_set);
        }
        if let Some(reply_to) = &message.reply_to {
            request = request.reply_to_addresses(reply_to);
        }

        let output = request.send().await.map_err(provider_error)?;
        let message_id = output.message_id().unwrap_or_default().to_string();

        debug!(message_id = %message_id, "Email sent successfully via AWS SES");
        Ok(SendResult {
            message_id,
            provider: self.name().to_string(),
        })
    }

    async fn send_raw_email(&self, from: &str, to: &[String], raw: &[u8]) -> Result<SendResult> {
        let raw_message = RawMessage::builder()
            .data(Blob::new(raw))
            .build()
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;

        let mut request = self
            .client
            .send_email()
            .from_email_address(from)
            .destination(Destination::builder().set_to_addresses(Some(to.to_vec())).build())
            .content(EmailContent::builder().raw(raw_message).build());

        if let Some(config_set) = &self.config.configuration_set {
            request = request.configuration_set_name(config_set);
        }

        let output = request.send().await.map_err(provider_error)?;
        Ok(SendResult {
            message_id: output.message_id().unwrap_or_default().to_string(),
            provider: self.name().to_string(),
        })
    }

    async fn verify_domain(&self, domain: &str) -> Result<DomainVerification> {
        let created = self
            .client
            .create_email_identity()
            .email_identity(domain)
            .dkim_signing_attributes(
                DkimSigningAttributes::builder()
                    .next_signing_key_length(DkimSigningKeyLength::Rsa2048Bit)
                    .build(),
            )
            .send()
            .await;

        let output = match created {
            Ok(output) => output,
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_already_exists_exception() {
                    return self.identity(domain).await;
                }
                return Err(provider_error(service_error));
            }
        };

        let mail_from_domain = self.mail_from_domain(domain);
        if let Some(mail_from) = &mail_from_domain {
            let result = self
                .client
                .put_email_identity_mail_from_attributes()
                .email_identity(domain)
                .mail_from_domain(mail_from)
                .send()
                .await;
            if let Err(err) = result {
                warn!(domain, error = %provider_error(err), "Failed to configure MAIL FROM domain");
            }
        }

        Ok(DomainVerification {
            domain: domain.to_string(),
            dkim_tokens: output
                .dkim_attributes()
                .map(|dkim| dkim.tokens().to_vec())
                .unwrap_or_default(),
            status: if output.verified_for_sending_status() {
                VerificationStatus::Verified
            } else {
                VerificationStatus::Pending
            },
            mail_from_domain,
        })
    }

    async fn check_domain_verification(&self, domain: &str) -> Result<DomainVerification> {
        self.identity(domain).await
    }

    async fn get_send_quota(&self) -> Result<SendQuota> {
        let account = self.client.get_account().send().await.map_err(provider_error)?;

        Ok(account
            .send_quota()
            .map(|quota| SendQuota {
                max_24h_send: quota.max24_hour_send(),
                max_send_rate: quota.max_send_rate(),
                sent_last_24h: quota.sent_last24_hours(),
            })
            .unwrap_or_default())
    }

    async fn is_healthy(&self) -> bool {
        self.client.get_account().send().await.is_ok()
    }
}
