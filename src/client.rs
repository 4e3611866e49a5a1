//! Chat-protocol client capability
//!
//! The worker never speaks the chat protocol itself. An embedding binary plugs
//! a concrete client in through [`ClientConnector`]; each connection hands back
//! an exclusively owned [`ChatHandle`] plus a bounded stream of lifecycle and
//! message events.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::AccountId;

/// Capacity of the per-session client event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Failure reported by the underlying client library
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ClientError {
    pub code: Option<String>,
    pub message: String,
}

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

/// Kind of outbound content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Image,
    Video,
    Document,
    Audio,
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContentKind::Text => "text",
            ContentKind::Image => "image",
            ContentKind::Video => "video",
            ContentKind::Document => "document",
            ContentKind::Audio => "audio",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ContentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(ContentKind::Text),
            "image" => Ok(ContentKind::Image),
            "video" => Ok(ContentKind::Video),
            "document" => Ok(ContentKind::Document),
            "audio" => Ok(ContentKind::Audio),
            _ => Err(Error::UnsupportedType(s.to_string())),
        }
    }
}

/// Typed content ready to hand to the client
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundContent {
    Text {
        body: String,
    },
    Image {
        url: String,
        caption: String,
    },
    Video {
        url: String,
        caption: String,
    },
    Document {
        url: String,
        file_name: String,
        mime_type: String,
    },
    Audio {
        url: String,
        mime_type: String,
    },
}

impl OutboundContent {
    /// Build content from a request's loose fields
    pub fn build(kind: &str, body: &str, media_url: Option<&str>) -> Result<Self> {
        let kind: ContentKind = kind.parse()?;
        let require_url = || {
            media_url
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .ok_or(Error::MissingMedia(kind))
        };

        Ok(match kind {
            ContentKind::Text => OutboundContent::Text {
                body: body.to_string(),
            },
            ContentKind::Image => OutboundContent::Image {
                url: require_url()?,
                caption: body.to_string(),
            },
            ContentKind::Video => OutboundContent::Video {
                url: require_url()?,
                caption: body.to_string(),
            },
            ContentKind::Document => {
                let url = require_url()?;
                let file_name = if body.trim().is_empty() {
                    file_name_from_url(&url)
                } else {
                    body.to_string()
                };
                let mime_type = document_mime_type(&file_name).to_string();
                OutboundContent::Document {
                    url,
                    file_name,
                    mime_type,
                }
            }
            ContentKind::Audio => OutboundContent::Audio {
                url: require_url()?,
                mime_type: "audio/mp4".to_string(),
            },
        })
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            OutboundContent::Text { .. } => ContentKind::Text,
            OutboundContent::Image { .. } => ContentKind::Image,
            OutboundContent::Video { .. } => ContentKind::Video,
            OutboundContent::Document { .. } => ContentKind::Document,
            OutboundContent::Audio { .. } => ContentKind::Audio,
        }
    }
}

fn file_name_from_url(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or("document")
        .to_string()
}

fn document_mime_type(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "txt" => "text/plain",
        "zip" => "application/zip",
        _ => "application/pdf",
    }
}

/// Reference to a message accepted by the chat service
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRef {
    pub id: String,
}

/// Transport-level state, distinct from protocol readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Why the client closed its connection
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    /// Credentials revoked by the service; permanent
    LoggedOut,
    /// Authentication challenge timed out before being confirmed
    ChallengeExpired,
    /// Another client took over this account
    Conflict,
    /// Protocol stream error; transient
    StreamError(String),
    /// Network drop; transient
    ConnectionLost(String),
    /// Client cannot continue in any form
    Fatal(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::LoggedOut => write!(f, "logged_out"),
            DisconnectReason::ChallengeExpired => write!(f, "challenge_expired"),
            DisconnectReason::Conflict => write!(f, "conflict"),
            DisconnectReason::StreamError(m) => write!(f, "stream_error: {}", m),
            DisconnectReason::ConnectionLost(m) => write!(f, "connection_lost: {}", m),
            DisconnectReason::Fatal(m) => write!(f, "fatal: {}", m),
        }
    }
}

/// Message received from the chat service
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub id: Option<String>,
    pub from: String,
    pub body: String,
    pub timestamp: i64,
    pub has_media: bool,
    pub kind: String,
}

/// Events emitted by a live client connection
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// New authentication-challenge token to be rendered externally
    Qr(String),
    /// Authenticated and ready to send
    Open,
    Closed(DisconnectReason),
    /// Credential material changed and should be persisted
    CredentialsUpdated(serde_json::Value),
    Message(InboundMessage),
}

/// Parameters for opening one client connection
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub session_id: String,
    pub account_id: AccountId,
    pub phone_number: String,
    pub credentials: Option<serde_json::Value>,
}

/// A freshly opened connection
pub struct Connection {
    pub handle: Box<dyn ChatHandle>,
    pub events: mpsc::Receiver<ClientEvent>,
}

/// Opens client connections
#[async_trait]
pub trait ClientConnector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> std::result::Result<Connection, ClientError>;
}

/// Live connection owned by exactly one session
#[async_trait]
pub trait ChatHandle: Send + Sync {
    async fn send_content(
        &self,
        recipient: &str,
        content: &OutboundContent,
    ) -> std::result::Result<MessageRef, ClientError>;

    /// Cheap transport liveness check
    async fn connection_state(&self) -> std::result::Result<ConnectionState, ClientError>;

    /// Revoke credentials with the service and close
    async fn logout(&self) -> std::result::Result<(), ClientError>;

    /// Close the connection, keeping credentials valid
    async fn disconnect(&self) -> std::result::Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_kind_parse() {
        assert_eq!("TEXT".parse::<ContentKind>().unwrap(), ContentKind::Text);
        assert_eq!(" Image ".parse::<ContentKind>().unwrap(), ContentKind::Image);
        let err = "location".parse::<ContentKind>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(ref t) if t == "location"));
    }

    #[test]
    fn test_text_ignores_media() {
        let content = OutboundContent::build("text", "hello", None).unwrap();
        assert_eq!(
            content,
            OutboundContent::Text {
                body: "hello".to_string()
            }
        );
    }

    #[test]
    fn test_media_requires_url() {
        for kind in ["image", "video", "document", "audio"] {
            let err = OutboundContent::build(kind, "caption", None).unwrap_err();
            assert!(matches!(err, Error::MissingMedia(_)), "{}", kind);
            let err = OutboundContent::build(kind, "caption", Some("  ")).unwrap_err();
            assert!(matches!(err, Error::MissingMedia(_)), "{}", kind);
        }
    }

    #[test]
    fn test_document_file_name() {
        let content =
            OutboundContent::build("document", "", Some("https://cdn.example/f/report.xlsx?sig=1"))
                .unwrap();
        match content {
            OutboundContent::Document {
                file_name,
                mime_type,
                ..
            } => {
                assert_eq!(file_name, "report.xlsx");
                assert!(mime_type.contains("spreadsheet"));
            }
            other => panic!("expected document, got {:?}", other),
        }

        let content =
            OutboundContent::build("document", "Invoice.pdf", Some("https://cdn.example/x")).unwrap();
        assert!(matches!(
            content,
            OutboundContent::Document { ref file_name, ref mime_type, .. }
                if file_name == "Invoice.pdf" && mime_type == "application/pdf"
        ));
    }

    #[test]
    fn test_unsupported_kind() {
        let err = OutboundContent::build("sticker", "", Some("https://x")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)));
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(DisconnectReason::LoggedOut.to_string(), "logged_out");
        assert_eq!(
            DisconnectReason::StreamError("515".into()).to_string(),
            "stream_error: 515"
        );
    }
}
