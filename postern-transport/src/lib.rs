//! # Postern Transport
//!
//! The boundary between the delivery engine and whatever actually moves mail.
//!
//! ## Features
//!
//! - **SMTP**: lettre-based transport with STARTTLS, implicit TLS or plain connections
//! - **AWS SES**: SES v2 simple and raw sends, domain identities and quota (feature `ses`)
//! - **Failure classification**: every [`TransportError`] maps to an [`ErrorClass`]
//! - **Mock**: a recording, scriptable transport for tests (feature `testing`)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use postern_transport::{OutboundMessage, SmtpConfig, TransportConfig, build_transport};
//!
//! # async fn run() -> postern_transport::Result<()> {
//! let config = TransportConfig::Smtp(
//!     SmtpConfig::new("smtp.example.com").credentials("user", "password"),
//! );
//! let transport = build_transport(&config).await?;
//!
//! let message = OutboundMessage::new("Acme <news@acme.test>", "Hello")
//!     .to("ada@example.com")
//!     .text("Hello from postern")
//!     .message_id("<0b6f0c1e@acme.test>");
//!
//! let result = transport.send_email(&message).await?;
//! println!("accepted as {}", result.message_id);
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod message;
mod smtp;
mod transport;

#[cfg(feature = "ses")]
mod ses;

#[cfg(any(test, feature = "testing"))]
mod mock;

pub use config::{SesConfig, TransportConfig, build_transport};
pub use error::{ErrorClass, Result, TransportError};
pub use message::{DomainVerification, OutboundMessage, SendQuota, SendResult, VerificationStatus};
pub use smtp::{SmtpConfig, SmtpSecurity, SmtpTransport};
pub use transport::Transport;

#[cfg(feature = "ses")]
pub use ses::SesTransport;

#[cfg(any(test, feature = "testing"))]
pub use mock::MockTransport;
