//! Transport error types and failure classification.

use thiserror::Error;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Substrings marking a failure that may succeed if tried again.
const RETRYABLE_PATTERNS: [&str; 10] = [
    "connection refused",
    "connection reset",
    "timeout",
    "temporary",
    "try again",
    "service unavailable",
    "421",
    "450",
    "451",
    "452",
];

/// Substrings marking a failure that will never succeed for this recipient.
const PERMANENT_PATTERNS: [&str; 8] = [
    "user unknown",
    "mailbox not found",
    "invalid address",
    "550",
    "551",
    "552",
    "553",
    "554",
];

/// How a delivery failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; retry with backoff.
    Retryable,
    /// The recipient will never accept this mail; suppress it.
    Permanent,
    /// Neither; give up without suppressing.
    Unknown,
}

impl ErrorClass {
    /// Classify a provider or SMTP error message. Retryable patterns are checked first.
    pub fn of(message: &str) -> Self {
        let message = message.to_lowercase();
        if RETRYABLE_PATTERNS.iter().any(|p| message.contains(p)) {
            Self::Retryable
        } else if PERMANENT_PATTERNS.iter().any(|p| message.contains(p)) {
            Self::Permanent
        } else {
            Self::Unknown
        }
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// SMTP protocol or connection error.
    #[error("SMTP error: {0}")]
    Smtp(String),

    /// Provider API error.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Invalid email address.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The message could not be built.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Missing required field.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Operation not offered by this transport.
    #[error("{0} is not supported by this transport")]
    NotSupported(&'static str),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout error.
    #[error("Operation timed out")]
    Timeout,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Failure class used by senders to decide between retry, suppression or giving up.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout => ErrorClass::Retryable,
            Self::InvalidAddress(_) => ErrorClass::Permanent,
            Self::MissingField(_) | Self::NotSupported(_) | Self::Config(_) => {
                ErrorClass::Unknown
            }
            other => ErrorClass::of(&other.to_string()),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Check if this error is a permanent rejection.
    pub fn is_permanent(&self) -> bool {
        self.class() == ErrorClass::Permanent
    }
}

impl From<lettre::transport::smtp::Error> for TransportError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        match err.status() {
            Some(code) => Self::Smtp(format!("{} {}", code, err)),
            None => Self::Smtp(err.to_string()),
        }
    }
}

impl From<lettre::address::AddressError> for TransportError {
    fn from(err: lettre::address::AddressError) -> Self {
        Self::InvalidAddress(err.to_string())
    }
}

impl From<lettre::error::Error> for TransportError {
    fn from(err: lettre::error::Error) -> Self {
        Self::InvalidMessage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_patterns() {
        for message in [
            "dial tcp: connection refused",
            "read: Connection Reset by peer",
            "i/o timeout",
            "421 4.7.0 Try again later",
            "451 temporary local problem",
            "Service Unavailable",
        ] {
            assert_eq!(ErrorClass::of(message), ErrorClass::Retryable, "{message}");
        }
    }

    #[test]
    fn test_permanent_patterns() {
        for message in [
            "550 5.1.1 User unknown",
            "mailbox not found",
            "553 sender rejected",
            "554 transaction failed",
        ] {
            assert_eq!(ErrorClass::of(message), ErrorClass::Permanent, "{message}");
        }
    }

    #[test]
    fn test_retryable_wins_over_permanent() {
        assert_eq!(
            ErrorClass::of("550 mailbox busy, temporary condition"),
            ErrorClass::Retryable
        );
    }

    #[test]
    fn test_unclassified() {
        assert_eq!(ErrorClass::of("something odd happened"), ErrorClass::Unknown);
        assert_eq!(
            TransportError::NotSupported("domain verification").class(),
            ErrorClass::Unknown
        );
    }

    #[test]
    fn test_error_variants() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::InvalidAddress("nope".into()).is_permanent());
        assert!(TransportError::Provider("MessageRejected: 554 Email address is not verified".into()).is_permanent());
    }
}
