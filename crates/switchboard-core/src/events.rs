//! Wire events exchanged between clients and the gateway.
//!
//! Every WebSocket text frame carries one JSON object of the form
//! `{"event": "<name>", "data": {...}}`. Inbound event names are kebab-case,
//! outbound names are camelCase. Payload fields are camelCase.

use crate::identity::Role;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound event names.
pub mod inbound {
    pub const HEARTBEAT: &str = "heartbeat";
    pub const SEND_MESSAGE: &str = "send-message";
    pub const ADMIN_SEND_MESSAGE: &str = "admin-send-message";
    pub const MARK_READ: &str = "mark-read";
    pub const ADMIN_MARK_READ: &str = "admin-mark-read";
    pub const GET_RECONNECT_STATE: &str = "get-reconnect-state";
    pub const SAVE_RECONNECT_STATE: &str = "save-reconnect-state";
}

/// Connection error codes sent in `connectionError`.
pub mod codes {
    pub const MAX_CONNECTIONS_EXCEEDED: &str = "MAX_CONNECTIONS_EXCEEDED";
    pub const QUOTA_UNAVAILABLE: &str = "QUOTA_UNAVAILABLE";
    pub const UNKNOWN_EVENT: &str = "UNKNOWN_EVENT";
}

/// Reasons carried by `reconnectRequested`.
pub mod reasons {
    pub const HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";
    pub const SERVER_SHUTDOWN: &str = "server_shutdown";
}

fn default_content_kind() -> String {
    "text".to_string()
}

// ── Inbound ──────────────────────────────────────────────────────────

/// A decoded inbound frame; `data` is parsed by the handler for `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub content: String,
    #[serde(default = "default_content_kind")]
    pub content_kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminSendMessagePayload {
    pub conversation_id: String,
    pub content: String,
    #[serde(default = "default_content_kind")]
    pub content_kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminMarkReadPayload {
    pub conversation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReconnectStatePayload {
    pub state: Value,
}

// ── Outbound ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub connection_id: String,
    pub reconnect_delay_min: u64,
    pub reconnect_delay_max: u64,
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAckPayload {
    /// Echo of the client's timestamp, for round-trip estimation.
    pub timestamp: Option<u64>,
    /// Server wall clock, milliseconds since the Unix epoch.
    pub server_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectRequestedPayload {
    pub reason: String,
    pub timestamp: u64,
}

/// A persisted chat message as pushed in `newMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    pub content_kind: String,
    /// Server timestamp assigned by the persistence service (ms).
    pub created_at: u64,
}

/// A message parked in a recipient's offline queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub sender_id: String,
    pub sender_role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    pub content_kind: String,
    /// Enqueue time, milliseconds since the Unix epoch.
    pub enqueued_at: u64,
}

impl QueuedMessage {
    /// Park a persisted message, stamping it with the enqueue time.
    pub fn from_chat(message: &ChatMessage, enqueued_at: u64) -> Self {
        Self {
            conversation_id: Some(message.conversation_id.clone()),
            sender_id: message.sender_id.clone(),
            sender_role: message.sender_role,
            sender_name: message.sender_name.clone(),
            content: message.content.clone(),
            content_kind: message.content_kind.clone(),
            enqueued_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessagesPayload {
    pub messages: Vec<QueuedMessage>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountPayload {
    pub conversation_id: String,
    pub unread_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectStatePayload {
    pub state: Option<Value>,
}

/// Inline failure reply for a single inbound event; the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub event: String,
    pub code: String,
    pub message: String,
}

/// Every event the gateway pushes to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    Connected(ConnectedPayload),
    ConnectionError(ConnectionErrorPayload),
    HeartbeatAck(HeartbeatAckPayload),
    ReconnectRequested(ReconnectRequestedPayload),
    NewMessage(ChatMessage),
    QueuedMessages(QueuedMessagesPayload),
    UnreadCountUpdated(UnreadCountPayload),
    ReconnectState(ReconnectStatePayload),
    Error(ErrorPayload),
}

impl ServerEvent {
    /// Wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected(_) => "connected",
            ServerEvent::ConnectionError(_) => "connectionError",
            ServerEvent::HeartbeatAck(_) => "heartbeatAck",
            ServerEvent::ReconnectRequested(_) => "reconnectRequested",
            ServerEvent::NewMessage(_) => "newMessage",
            ServerEvent::QueuedMessages(_) => "queuedMessages",
            ServerEvent::UnreadCountUpdated(_) => "unreadCountUpdated",
            ServerEvent::ReconnectState(_) => "reconnectState",
            ServerEvent::Error(_) => "error",
        }
    }

    pub fn error(event: &str, code: &str, message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            event: event.to_string(),
            code: code.to_string(),
            message: message.into(),
        })
    }

    pub fn reconnect_requested(reason: &str, timestamp: u64) -> Self {
        ServerEvent::ReconnectRequested(ReconnectRequestedPayload {
            reason: reason.to_string(),
            timestamp,
        })
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
