//! JSON wire protocol for the collaboration relay.
//!
//! Wire format (one JSON object per WebSocket text frame):
//! ```text
//! ┌────────────┬──────────────────────────────────────────┐
//! │ "type"     │ event kind discriminator (kebab-case)    │
//! │ fields…    │ camelCase payload fields per kind        │
//! └────────────┴──────────────────────────────────────────┘
//! ```
//!
//! Inbound kinds: `join`, `code-change`, `cursor-move`, `chat-message`,
//! `name-change`. Outbound kinds: `joined`, `user-joined`, `user-left`,
//! `user-update`, `code-update`, `cursor-update`, `chat-message`, `error`.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 4

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cursor position inside the shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPos {
    pub line: u32,
    pub ch: u32,
}

impl CursorPos {
    pub fn new(line: u32, ch: u32) -> Self {
        Self { line, ch }
    }
}

impl Default for CursorPos {
    fn default() -> Self {
        Self { line: 0, ch: 0 }
    }
}

/// One entry of a session's append-only chat log.
///
/// `author_name` is a snapshot of the author's display name at send time;
/// it stays `None` when the author never picked a name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub author_id: Uuid,
    pub author_name: Option<String>,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// A member's public identity as seen by other members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: Uuid,
    pub name: Option<String>,
    pub color: String,
    pub cursor: CursorPos,
}

/// Client → hub events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Announce profile and optionally seed an empty buffer.
    #[serde(rename = "join", rename_all = "camelCase")]
    Join {
        user_name: Option<String>,
        initial_code: Option<String>,
    },

    /// Replace the whole shared buffer (last-writer-wins).
    #[serde(rename = "code-change")]
    CodeChange { code: String },

    /// Move the sender's cursor.
    #[serde(rename = "cursor-move")]
    CursorMove { cursor: CursorPos },

    /// Append to the session chat log.
    #[serde(rename = "chat-message")]
    Chat { message: String },

    /// Change the sender's display name.
    #[serde(rename = "name-change", rename_all = "camelCase")]
    NameChange { new_name: String },
}

/// Hub → client notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Reply to the caller's own join: identity plus a consistent
    /// snapshot of the session at the instant it was admitted.
    #[serde(rename = "joined", rename_all = "camelCase")]
    Joined {
        session_id: String,
        user_id: Uuid,
        color: String,
        users: Vec<UserView>,
        code: String,
        chat_messages: Vec<ChatMessage>,
    },

    /// Another member entered the session.
    #[serde(rename = "user-joined", rename_all = "camelCase")]
    UserJoined {
        user_id: Uuid,
        name: Option<String>,
        color: String,
    },

    /// A member left the session.
    #[serde(rename = "user-left", rename_all = "camelCase")]
    UserLeft { user_id: Uuid },

    /// A member changed its display name.
    #[serde(rename = "user-update", rename_all = "camelCase")]
    UserUpdate { user_id: Uuid, new_name: String },

    /// The shared buffer was replaced.
    #[serde(rename = "code-update", rename_all = "camelCase")]
    CodeUpdate { user_id: Uuid, code: String },

    /// A member moved its cursor.
    #[serde(rename = "cursor-update", rename_all = "camelCase")]
    CursorUpdate {
        user_id: Uuid,
        user_name: Option<String>,
        cursor: CursorPos,
    },

    /// A chat message was appended (delivered to the author too).
    #[serde(rename = "chat-message")]
    Chat { message: ChatMessage },

    /// Recoverable protocol error, sent only to the offending connection.
    #[serde(rename = "error")]
    Error { message: String },
}

impl ClientMessage {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

impl ServerMessage {
    /// Build an `error` notification.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
