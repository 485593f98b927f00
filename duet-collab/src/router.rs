//! Dispatch of inbound events to session mutations.
//!
//! Decoding is two-phase so failures classify cleanly: the raw frame is
//! parsed to JSON first (failure = malformed payload), then the `type`
//! discriminator is checked against the known kinds (failure = unknown
//! kind), and only then is the typed payload decoded (failure = missing
//! or invalid required field). Every failure is answered with an `error`
//! to the originating connection alone; none of them mutates state or
//! terminates the connection.

use uuid::Uuid;

use crate::protocol::ClientMessage;
use crate::session::Session;

/// Event kinds the hub accepts.
const KNOWN_KINDS: [&str; 5] = [
    "join",
    "code-change",
    "cursor-move",
    "chat-message",
    "name-change",
];

/// Classified inbound-event failures, all recoverable.
#[derive(Debug, Clone)]
pub enum RouteError {
    /// The frame was not a JSON object with a string `type` field.
    Malformed(String),
    /// The discriminator named no known event kind.
    UnknownKind(String),
    /// A known kind arrived with missing or ill-typed fields.
    InvalidPayload { kind: String, detail: String },
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(detail) => write!(f, "malformed message: {detail}"),
            Self::UnknownKind(kind) => write!(f, "unknown event kind `{kind}`"),
            Self::InvalidPayload { kind, detail } => {
                write!(f, "invalid `{kind}` message: {detail}")
            }
        }
    }
}

impl std::error::Error for RouteError {}

/// Stateless dispatcher from inbound frames to session mutations.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageRouter;

impl MessageRouter {
    /// Parse and classify a raw inbound frame.
    pub fn parse(&self, raw: &str) -> Result<ClientMessage, RouteError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| RouteError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| RouteError::Malformed("missing `type` discriminator".to_string()))?;
        if !KNOWN_KINDS.contains(&kind) {
            return Err(RouteError::UnknownKind(kind.to_string()));
        }
        let kind = kind.to_string();
        serde_json::from_value(value).map_err(|e| RouteError::InvalidPayload {
            kind,
            detail: e.to_string(),
        })
    }

    /// Apply a decoded event from `member_id` to `session`.
    ///
    /// Each arm performs exactly one serialized mutation; the resulting
    /// notification goes out through the session's broadcaster per the
    /// event's recipient rule (others-only, or everyone for chat).
    pub async fn dispatch(&self, session: &Session, member_id: Uuid, msg: ClientMessage) {
        match msg {
            ClientMessage::Join {
                user_name,
                initial_code,
            } => {
                // A repeated join refreshes the profile: the name change
                // notifies the others, the code seed only lands while the
                // buffer is still empty.
                if let Some(name) = user_name {
                    session.set_member_name(member_id, name).await;
                }
                if let Some(code) = initial_code {
                    session.set_code_if_empty(member_id, code).await;
                }
            }
            ClientMessage::CodeChange { code } => {
                session.set_code(member_id, code).await;
            }
            ClientMessage::CursorMove { cursor } => {
                session.update_cursor(member_id, cursor).await;
            }
            ClientMessage::Chat { message } => {
                let stored = session.append_chat(member_id, message).await;
                log::debug!(
                    "Chat {} appended to session `{}`",
                    stored.id,
                    session.id()
                );
            }
            ClientMessage::NameChange { new_name } => {
                session.set_member_name(member_id, new_name).await;
            }
        }
    }

    /// Parse and dispatch one raw frame.
    pub async fn route(
        &self,
        session: &Session,
        member_id: Uuid,
        raw: &str,
    ) -> Result<(), RouteError> {
        let msg = self.parse(raw)?;
        self.dispatch(session, member_id, msg).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CursorPos, ServerMessage};
    use crate::session::Member;

    async fn session_with_members() -> (Session, Uuid, tokio::sync::broadcast::Receiver<crate::broadcast::Envelope>)
    {
        let session = Session::new("room1", 64);
        let observer = Member::new();
        let (_, rx) = session.add_member(observer, None).await;
        let actor = Member::new();
        let actor_id = actor.id;
        session.add_member(actor, None).await;
        (session, actor_id, rx)
    }

    fn drain(
        rx: &mut tokio::sync::broadcast::Receiver<crate::broadcast::Envelope>,
    ) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(env) = rx.try_recv() {
            out.push(ServerMessage::decode(&env.payload).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_code_change_routes_to_set_code() {
        let (session, actor, mut rx) = session_with_members().await;
        let router = MessageRouter;
        router
            .route(&session, actor, r#"{"type":"code-change","code":"x = 1"}"#)
            .await
            .unwrap();

        assert_eq!(session.code().await, "x = 1");
        let seen = drain(&mut rx);
        assert!(seen
            .iter()
            .any(|m| matches!(m, ServerMessage::CodeUpdate { code, .. } if code == "x = 1")));
    }

    #[tokio::test]
    async fn test_cursor_move_routes_to_update_cursor() {
        let (session, actor, mut rx) = session_with_members().await;
        MessageRouter
            .route(
                &session,
                actor,
                r#"{"type":"cursor-move","cursor":{"line":2,"ch":7}}"#,
            )
            .await
            .unwrap();

        let seen = drain(&mut rx);
        assert!(seen.iter().any(|m| matches!(
            m,
            ServerMessage::CursorUpdate { cursor, .. } if *cursor == CursorPos::new(2, 7)
        )));
    }

    #[tokio::test]
    async fn test_chat_routes_to_append_chat() {
        let (session, actor, mut rx) = session_with_members().await;
        MessageRouter
            .route(&session, actor, r#"{"type":"chat-message","message":"hi"}"#)
            .await
            .unwrap();

        assert_eq!(session.chat_len().await, 1);
        let seen = drain(&mut rx);
        assert!(seen
            .iter()
            .any(|m| matches!(m, ServerMessage::Chat { message } if message.text == "hi")));
    }

    #[tokio::test]
    async fn test_name_change_routes_to_set_member_name() {
        let (session, actor, mut rx) = session_with_members().await;
        MessageRouter
            .route(&session, actor, r#"{"type":"name-change","newName":"Bob"}"#)
            .await
            .unwrap();

        let seen = drain(&mut rx);
        assert!(seen
            .iter()
            .any(|m| matches!(m, ServerMessage::UserUpdate { new_name, .. } if new_name == "Bob")));
    }

    #[tokio::test]
    async fn test_join_sets_name_and_seeds_code_once() {
        let (session, actor, mut rx) = session_with_members().await;
        MessageRouter
            .route(
                &session,
                actor,
                r#"{"type":"join","userName":"Alice","initialCode":"print(1)"}"#,
            )
            .await
            .unwrap();

        assert_eq!(session.code().await, "print(1)");
        let seen = drain(&mut rx);
        assert!(seen
            .iter()
            .any(|m| matches!(m, ServerMessage::UserUpdate { new_name, .. } if new_name == "Alice")));
        assert!(seen
            .iter()
            .any(|m| matches!(m, ServerMessage::CodeUpdate { code, .. } if code == "print(1)")));

        // A second join must not clobber the buffer.
        MessageRouter
            .route(
                &session,
                actor,
                r#"{"type":"join","initialCode":"overwrite"}"#,
            )
            .await
            .unwrap();
        assert_eq!(session.code().await, "print(1)");
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_kind_is_classified_and_mutates_nothing() {
        let (session, actor, mut rx) = session_with_members().await;
        let err = MessageRouter
            .route(&session, actor, r#"{"type":"unknown-kind"}"#)
            .await
            .unwrap_err();

        match &err {
            RouteError::UnknownKind(kind) => assert_eq!(kind, "unknown-kind"),
            other => panic!("expected UnknownKind, got {other:?}"),
        }
        assert!(err.to_string().contains("unknown-kind"));
        assert_eq!(session.code().await, "");
        assert_eq!(session.chat_len().await, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_missing_required_field_is_classified() {
        let (session, actor, mut rx) = session_with_members().await;
        let err = MessageRouter
            .route(&session, actor, r#"{"type":"code-change"}"#)
            .await
            .unwrap_err();

        match &err {
            RouteError::InvalidPayload { kind, .. } => assert_eq!(kind, "code-change"),
            other => panic!("expected InvalidPayload, got {other:?}"),
        }
        assert_eq!(session.code().await, "");
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frames_are_classified() {
        let (session, actor, mut rx) = session_with_members().await;

        for raw in ["not json", "[1,2,3]", r#"{"kind":"code-change"}"#, r#"{"type":7}"#] {
            let err = MessageRouter.route(&session, actor, raw).await.unwrap_err();
            assert!(
                matches!(err, RouteError::Malformed(_)),
                "{raw} should be malformed, got {err:?}"
            );
        }
        assert!(drain(&mut rx).is_empty());
    }
}
