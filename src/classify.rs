//! Failure classification for client errors
//!
//! The client library reports failures as free text. Each rule here is a named
//! signature so that the heuristics can be revisited one at a time.

use crate::client::ClientError;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use std::fmt;

/// How a failed send attempt should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The body went out but the read/seen-marking step threw afterwards
    BenignConfirmation,
    /// The candidate address has no account; the next candidate may
    RecipientNotFound,
    /// Network-class failure, worth redelivering later
    Transient,
    /// Anything else; stop trying candidates
    Other,
}

impl fmt::Display for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SendFailure::BenignConfirmation => "benign_confirmation",
            SendFailure::RecipientNotFound => "recipient_not_found",
            SendFailure::Transient => "transient",
            SendFailure::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// Post-send seen-marking glitch
static BENIGN_CONFIRMATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)markedUnread").expect("Invalid benign regex"));

/// Candidate address is not on the service
static RECIPIENT_NOT_FOUND: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)not registered",
        r"No LID for user",
        r"(?i)no routing identifier",
    ])
    .expect("Invalid recipient regex")
});

/// Network-class failures
static TRANSIENT: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"ECONNREFUSED",
        r"ETIMEDOUT",
        r"ENOTFOUND",
        r"ENETUNREACH",
        r"EAI_AGAIN",
        r"(?i)connection refused",
        r"(?i)timed out",
        r"(?i)Session not connected",
        r"(?i)Session not ready",
    ])
    .expect("Invalid transient regex")
});

/// Account-level sanction by the service
static BAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(banned|blocked)\b").expect("Invalid ban regex"));

const INVALID_RECIPIENT_CODE: &str = "INVALID_RECIPIENT";
const INTENTIONAL_LOGOUT: &str = "Intentional Logout";

/// Classify one failed send attempt
pub fn classify_send_failure(err: &ClientError) -> SendFailure {
    let text = err.message.as_str();

    if BENIGN_CONFIRMATION.is_match(text) {
        return SendFailure::BenignConfirmation;
    }
    if err.code.as_deref() == Some(INVALID_RECIPIENT_CODE) || RECIPIENT_NOT_FOUND.is_match(text) {
        return SendFailure::RecipientNotFound;
    }
    if is_transient(text) {
        return SendFailure::Transient;
    }
    SendFailure::Other
}

/// Whether failure text belongs to the temporary class
pub fn is_transient(text: &str) -> bool {
    TRANSIENT.is_match(text)
}

/// Whether failure text indicates the sending account was sanctioned
pub fn indicates_ban(text: &str) -> bool {
    BAN.is_match(text)
}

/// Logout failures caused by a close we asked for ourselves
pub fn is_intentional_logout(err: &ClientError) -> bool {
    err.message == INTENTIONAL_LOGOUT
}
