//! Error types for mailstream

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The log or state store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid store request: {0}")]
    Invalid(String),

    /// No persisted token and no refresh token; interactive setup needed.
    #[error("authentication setup required: {0}")]
    AuthSetupRequired(String),

    #[error("token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("token revoked: {0}")]
    TokenRevoked(String),

    /// Connection-level IMAP failure; the session must be discarded.
    #[error("IMAP transport error: {0}")]
    ImapTransport(String),

    #[error("IMAP authentication failed: {0}")]
    ImapAuth(String),

    #[error("IMAP protocol error: {0}")]
    ImapProtocol(String),

    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    /// A record is missing required fields; routed to the DLQ without retry.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A processing failure worth retrying with backoff.
    #[error("transient processing failure: {0}")]
    ProcessingTransient(String),

    /// An entry was redelivered more times than the group allows.
    #[error("entry redelivered {0} times, exceeding the delivery limit")]
    ExcessiveRedelivery(u64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Orderly termination, not a failure.
    #[error("shutting down")]
    Shutdown,
}

impl Error {
    /// Stable kind label, used in DLQ envelopes and log fields.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "Unavailable",
            Self::NotFound(_) => "NotFound",
            Self::Invalid(_) => "Invalid",
            Self::AuthSetupRequired(_) => "AuthSetupRequired",
            Self::TokenRefreshFailed(_) => "TokenRefreshFailed",
            Self::TokenRevoked(_) => "TokenRevoked",
            Self::ImapTransport(_) => "ImapTransport",
            Self::ImapAuth(_) => "ImapAuth",
            Self::ImapProtocol(_) => "ImapProtocol",
            Self::CircuitOpen(_) => "CircuitOpen",
            Self::InvariantViolation(_) => "InvariantViolation",
            Self::ProcessingTransient(_) => "ProcessingTransient",
            Self::ExcessiveRedelivery(_) => "ExcessiveRedelivery",
            Self::Config(_) => "Config",
            Self::Io(_) => "Io",
            Self::Json(_) => "Json",
            Self::Shutdown => "Shutdown",
        }
    }

    /// Whether this failure should count against a circuit breaker.
    ///
    /// Only connection-level faults trip a breaker; protocol or data
    /// errors pass through without touching its failure count.
    #[must_use]
    pub const fn trips_breaker(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::ImapTransport(_) | Self::Io(_)
        )
    }

    /// Whether the worker may retry the record with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProcessingTransient(_) | Self::Unavailable(_) | Self::ImapTransport(_)
        )
    }

    /// Process exit code for fatal startup failures.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::AuthSetupRequired(_) => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
