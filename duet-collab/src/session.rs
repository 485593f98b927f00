//! Per-session shared state: members, code buffer, chat log.
//!
//! Architecture:
//! ```text
//! Connection A ──┐                       ┌──► Receiver A
//!                ├── Session ── Broadcaster ─► Receiver B
//! Connection B ──┘      │                └──► Receiver C
//!                       │
//!                ┌──────┴───────┐
//!                │ Mutex<State> │  members / code / chat
//!                └──────────────┘
//! ```
//!
//! Every mutation locks the state, applies the change, and hands the
//! resulting notification to the session's broadcaster *before*
//! unlocking. Because the broadcast send is synchronous, the sequence of
//! (mutation, notification) pairs forms one total order per session and
//! every member observes it identically — the property the rest of the
//! hub depends on.
//!
//! Reference: Kleppmann, Chapter 9 — Total Order Broadcast

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::broadcast::{Broadcaster, Envelope};
use crate::protocol::{ChatMessage, CursorPos, ServerMessage, UserView};

/// One connected participant's identity and presence inside a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub id: Uuid,
    /// Display name; absent until the member announces one.
    pub name: Option<String>,
    /// Stable display color, assigned at join and never changed.
    pub color: String,
    pub cursor: CursorPos,
}

impl Member {
    /// Create a member with a fresh id and a color derived from it.
    pub fn new() -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            name: None,
            color: color_from_id(id),
            cursor: CursorPos::default(),
        }
    }

    /// Create with an explicit id (for testing).
    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            name: None,
            color: color_from_id(id),
            cursor: CursorPos::default(),
        }
    }
}

impl Default for Member {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&Member> for UserView {
    fn from(m: &Member) -> Self {
        UserView {
            id: m.id,
            name: m.name.clone(),
            color: m.color.clone(),
            cursor: m.cursor,
        }
    }
}

/// Generate a stable, visually distinct `#rrggbb` color from a member id.
///
/// Same HSL scheme as cursor coloring elsewhere: hue from the id hash,
/// high saturation for vivid presence markers.
fn color_from_id(id: Uuid) -> String {
    let hash = id.as_u128();
    let hue = ((hash % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0) as u8,
        (g * 255.0) as u8,
        (b * 255.0) as u8
    )
}

/// HSL to RGB conversion helper.
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Milliseconds since the Unix epoch.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Consistent point-in-time view of a session, taken while admitting a
/// member and echoed back in its `joined` reply.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub users: Vec<UserView>,
    pub code: String,
    pub chat_messages: Vec<ChatMessage>,
}

/// Mutable session state, guarded by the session mutex.
#[derive(Debug, Default)]
struct SessionState {
    code: String,
    chat_history: Vec<ChatMessage>,
    members: HashMap<Uuid, Member>,
}

impl SessionState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            users: self.members.values().map(UserView::from).collect(),
            code: self.code.clone(),
            chat_messages: self.chat_history.clone(),
        }
    }
}

/// A named collaboration room: one shared code buffer, chat log, and
/// member set, plus the broadcaster that fans notifications out to the
/// members' connections.
#[derive(Debug)]
pub struct Session {
    id: String,
    state: Mutex<SessionState>,
    broadcaster: Broadcaster,
}

impl Session {
    /// Create an empty session.
    pub fn new(id: impl Into<String>, broadcast_capacity: usize) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(SessionState::default()),
            broadcaster: Broadcaster::new(broadcast_capacity),
        }
    }

    /// The session's external key (room name).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The session's broadcaster.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Admit a member: insert it, optionally seed an empty buffer with
    /// its initial code, subscribe its connection, and notify the others.
    ///
    /// The snapshot and the subscription are produced under the same lock
    /// as the insertion, so the `joined` reply can never miss or
    /// double-see a later notification.
    pub async fn add_member(
        &self,
        member: Member,
        initial_code: Option<String>,
    ) -> (SessionSnapshot, broadcast::Receiver<Envelope>) {
        let mut state = self.state.lock().await;
        let user_id = member.id;
        let name = member.name.clone();
        let color = member.color.clone();
        state.members.insert(user_id, member);

        let _ = self.broadcaster.broadcast(
            &ServerMessage::UserJoined {
                user_id,
                name,
                color,
            },
            Some(user_id),
        );

        if let Some(code) = initial_code {
            if state.code.is_empty() {
                state.code = code.clone();
                let _ = self.broadcaster.broadcast(
                    &ServerMessage::CodeUpdate { user_id, code },
                    Some(user_id),
                );
            }
        }

        let receiver = self.broadcaster.subscribe();
        (state.snapshot(), receiver)
    }

    /// Remove a member if present. Idempotent: removing an id twice is a
    /// no-op and only the first removal notifies the remaining members.
    pub async fn remove_member(&self, member_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        if state.members.remove(&member_id).is_none() {
            return false;
        }
        let _ = self.broadcaster.broadcast(
            &ServerMessage::UserLeft { user_id: member_id },
            Some(member_id),
        );
        true
    }

    /// Replace the code buffer unconditionally (last-writer-wins).
    pub async fn set_code(&self, origin: Uuid, code: String) {
        let mut state = self.state.lock().await;
        state.code = code.clone();
        let _ = self.broadcaster.broadcast(
            &ServerMessage::CodeUpdate {
                user_id: origin,
                code,
            },
            Some(origin),
        );
    }

    /// Seed the code buffer only when it is still empty, so late initial
    /// content never clobbers edits that already happened.
    ///
    /// Returns whether the buffer was seeded.
    pub async fn set_code_if_empty(&self, origin: Uuid, code: String) -> bool {
        let mut state = self.state.lock().await;
        if !state.code.is_empty() {
            return false;
        }
        state.code = code.clone();
        let _ = self.broadcaster.broadcast(
            &ServerMessage::CodeUpdate {
                user_id: origin,
                code,
            },
            Some(origin),
        );
        true
    }

    /// Move a member's cursor. Silently a no-op when the member has
    /// already left (cursor traffic races with disconnects).
    pub async fn update_cursor(&self, member_id: Uuid, cursor: CursorPos) {
        let mut state = self.state.lock().await;
        let user_name = match state.members.get_mut(&member_id) {
            Some(member) => {
                member.cursor = cursor;
                member.name.clone()
            }
            None => return,
        };
        let _ = self.broadcaster.broadcast(
            &ServerMessage::CursorUpdate {
                user_id: member_id,
                user_name,
                cursor,
            },
            Some(member_id),
        );
    }

    /// Set a member's display name. No-op when the member has left.
    pub async fn set_member_name(&self, member_id: Uuid, name: String) {
        let mut state = self.state.lock().await;
        match state.members.get_mut(&member_id) {
            Some(member) => member.name = Some(name.clone()),
            None => return,
        }
        let _ = self.broadcaster.broadcast(
            &ServerMessage::UserUpdate {
                user_id: member_id,
                new_name: name,
            },
            Some(member_id),
        );
    }

    /// Append a chat message, assigning its id and timestamp and
    /// snapshotting the author's current name. Delivered to every member
    /// including the author, all through the same ordered channel.
    pub async fn append_chat(&self, author_id: Uuid, text: String) -> ChatMessage {
        let mut state = self.state.lock().await;
        let message = ChatMessage {
            id: Uuid::new_v4(),
            author_id,
            author_name: state
                .members
                .get(&author_id)
                .and_then(|m| m.name.clone()),
            text,
            timestamp: now_ms(),
        };
        state.chat_history.push(message.clone());
        let _ = self.broadcaster.broadcast(
            &ServerMessage::Chat {
                message: message.clone(),
            },
            None,
        );
        message
    }

    /// Current member count.
    pub async fn member_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    /// Whether the session has no members left.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.members.is_empty()
    }

    /// Current code buffer contents.
    pub async fn code(&self) -> String {
        self.state.lock().await.code.clone()
    }

    /// Current membership view.
    pub async fn members(&self) -> Vec<UserView> {
        self.state
            .lock()
            .await
            .members
            .values()
            .map(UserView::from)
            .collect()
    }

    /// Number of chat messages recorded so far.
    pub async fn chat_len(&self) -> usize {
        self.state.lock().await.chat_history.len()
    }
}
