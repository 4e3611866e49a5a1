//! Error types for session-worker

use crate::client::{ClientError, ContentKind};
use crate::session::AccountId;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No active session for account ID: {0}")]
    NoActiveSession(AccountId),

    #[error("Session not connected for account ID: {0}")]
    SessionNotConnected(AccountId),

    #[error("Session already exists for account ID: {0}")]
    AlreadyExists(AccountId),

    #[error("Recipient {recipient} is not registered: {reason}")]
    InvalidRecipient { recipient: String, reason: String },

    #[error("Media URL is required for {0} messages")]
    MissingMedia(ContentKind),

    #[error("Unsupported message type: {0}")]
    UnsupportedType(String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Authentication challenge expired after {attempts} attempts")]
    AuthChallengeExpired { attempts: u32 },

    #[error("Account {0} was logged out")]
    LoggedOut(AccountId),

    #[error("Unrecoverable client fault: {0}")]
    UnrecoverableClientFault(String),

    #[error("Worker is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Whether redelivering the same request later may succeed without changes
    pub fn is_temporary(&self) -> bool {
        match self {
            Error::TransientNetwork(_)
            | Error::Timeout { .. }
            | Error::SessionNotConnected(_)
            | Error::ShuttingDown => true,
            Error::Client(e) => crate::classify::is_transient(&e.to_string()),
            _ => false,
        }
    }

    /// Stable machine-readable code reported alongside failures
    pub fn code(&self) -> &str {
        match self {
            Error::NoActiveSession(_) => "NO_ACTIVE_SESSION",
            Error::SessionNotConnected(_) => "SESSION_NOT_CONNECTED",
            Error::AlreadyExists(_) => "SESSION_EXISTS",
            Error::InvalidRecipient { .. } => "INVALID_RECIPIENT",
            Error::MissingMedia(_) => "MISSING_MEDIA",
            Error::UnsupportedType(_) => "UNSUPPORTED_TYPE",
            Error::TransientNetwork(_) => "TRANSIENT_NETWORK",
            Error::Timeout { .. } => "TIMEOUT",
            Error::AuthChallengeExpired { .. } => "AUTH_CHALLENGE_EXPIRED",
            Error::LoggedOut(_) => "LOGGED_OUT",
            Error::UnrecoverableClientFault(_) => "CLIENT_FAULT",
            Error::ShuttingDown => "SHUTTING_DOWN",
            Error::Client(e) => e.code.as_deref().unwrap_or("UNKNOWN"),
            Error::InvalidPayload(_) => "INVALID_PAYLOAD",
            Error::Io(_) => "IO",
            Error::Json(_) => "JSON",
            Error::Http(_) => "HTTP",
            Error::Config(_) => "CONFIG",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
