//! Queue payloads, inbound and outbound, and the sink that publishes them

use crate::config::QueueNames;
use crate::health::{HealthRecord, WorkerStatus};
use crate::queue::Publisher;
use crate::session::AccountId;
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Account ids arrive as numbers or numeric strings
fn flexible_account_id<'de, D>(deserializer: D) -> Result<AccountId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(AccountId),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid account id {:?}", s))),
    }
}

fn flexible_account_id_opt<'de, D>(deserializer: D) -> Result<Option<AccountId>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "flexible_account_id")] AccountId);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(id)| id))
}

fn default_kind() -> String {
    "text".to_string()
}

// ============================================================================
// Inbound
// ============================================================================

/// message-send payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub message_id: serde_json::Value,
    pub recipient_number: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(
        alias = "whatsappNumberId",
        alias = "numberId",
        deserialize_with = "flexible_account_id"
    )]
    pub account_id: AccountId,
    #[serde(default)]
    pub media_url: Option<String>,
}

/// number-health inbound payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckRequest {
    pub action: String,
    #[serde(alias = "numberId", default, deserialize_with = "flexible_account_id_opt")]
    pub account_id: Option<AccountId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdateData {
    #[serde(alias = "numberId", default, deserialize_with = "flexible_account_id_opt")]
    pub account_id: Option<AccountId>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
}

/// session-update payload
#[derive(Debug, Clone, Deserialize)]
pub struct SessionUpdate {
    pub action: String,
    #[serde(default)]
    pub data: SessionUpdateData,
}

// ============================================================================
// Outbound
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

/// message-receive payload describing a send outcome
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatusEvent {
    pub message_id: serde_json::Value,
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whatsapp_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporary: Option<bool>,
    pub timestamp: i64,
}

/// message-receive payload for a message that arrived on a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessageEvent {
    pub session_id: String,
    pub account_id: AccountId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub from: String,
    pub body: String,
    pub timestamp: i64,
    pub has_media: bool,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerAction {
    QrGenerated,
    QrRegenerating,
    Connected,
    Disconnected,
    Error,
    SessionConflict,
}

/// worker-events payload for lifecycle transitions
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEvent {
    pub action: WorkerAction,
    pub account_id: AccountId,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: i64,
}

impl WorkerEvent {
    pub fn new(action: WorkerAction, account_id: AccountId, session_id: &str) -> Self {
        Self {
            action,
            account_id,
            session_id: session_id.to_string(),
            qr_code: None,
            attempt: None,
            reason: None,
            error: None,
            message: None,
            timestamp: now_millis(),
        }
    }

    pub fn qr_code(mut self, qr: impl Into<String>) -> Self {
        self.qr_code = Some(qr.into());
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

// ============================================================================
// Sink
// ============================================================================

/// Publishes outbound payloads to their channels
///
/// Publishing is best-effort: failures are logged and swallowed so that a
/// broker hiccup never aborts a lifecycle transition half-way.
#[derive(Clone)]
pub struct EventSink {
    publisher: Arc<dyn Publisher>,
    queues: QueueNames,
    worker_id: String,
}

impl EventSink {
    pub fn new(publisher: Arc<dyn Publisher>, queues: QueueNames, worker_id: &str) -> Self {
        Self {
            publisher,
            queues,
            worker_id: worker_id.to_string(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn queues(&self) -> &QueueNames {
        &self.queues
    }

    async fn publish<T: Serialize>(&self, channel: &str, payload: &T) -> bool {
        let value = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(channel, error = %e, "Failed to serialize payload");
                return false;
            }
        };
        match self.publisher.publish(channel, &value).await {
            Ok(()) => true,
            Err(e) => {
                warn!(channel, error = %e, "Failed to publish payload");
                false
            }
        }
    }

    pub async fn message_status(&self, event: &MessageStatusEvent) -> bool {
        self.publish(&self.queues.message_receive, event).await
    }

    pub async fn inbound_message(&self, event: &InboundMessageEvent) -> bool {
        self.publish(&self.queues.message_receive, event).await
    }

    pub async fn health(&self, record: &HealthRecord) -> bool {
        self.publish(&self.queues.number_health, record).await
    }

    pub async fn worker_event(&self, event: &WorkerEvent) -> bool {
        self.publish(&self.queues.worker_events, event).await
    }

    pub async fn worker_status(&self, status: &WorkerStatus) -> bool {
        let payload = serde_json::json!({
            "action": "worker_status",
            "data": status,
        });
        self.publish(&self.queues.session_update, &payload).await
    }
}
