//! WebSocket client for connecting to the relay server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Typed send helpers for every inbound event kind
//! - An event channel surfacing every hub notification
//!
//! Used by embedders and by the integration tests, which drive real
//! clients against a real server.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, CursorPos, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the relay client.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A notification from the hub
    Message(ServerMessage),
}

/// The relay client.
///
/// Connects to `ws://host/<session-id>` and immediately announces itself
/// with a `join` frame carrying the configured profile, so the `joined`
/// snapshot reflects the name and initial code atomically.
pub struct RelayClient {
    server_url: String,
    session_id: String,
    user_name: Option<String>,
    initial_code: Option<String>,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<RelayEvent>>,

    /// Event sender (held by connection tasks)
    event_tx: mpsc::Sender<RelayEvent>,
}

impl RelayClient {
    /// Create a new client for the given server URL and session.
    pub fn new(server_url: impl Into<String>, session_id: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            session_id: session_id.into(),
            user_name: None,
            initial_code: None,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Set the display name announced at join.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    /// Set the code offered to seed an empty session buffer at join.
    pub fn with_initial_code(mut self, code: impl Into<String>) -> Self {
        self.initial_code = Some(code.into());
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RelayEvent>> {
        self.event_rx.take()
    }

    /// The session this client targets.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Connect to the server and announce the join.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.server_url, self.session_id);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("Connect to {url} failed: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing frames, close the socket on hangup
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Announce ourselves; the hub admits us on this first frame.
        let join = ClientMessage::Join {
            user_name: self.user_name.clone(),
            initial_code: self.initial_code.clone(),
        };
        self.send(&join).await?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(RelayEvent::Connected).await;

        // Reader task: surface hub notifications as events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(server_msg) => {
                            let _ = event_tx.send(RelayEvent::Message(server_msg)).await;
                        }
                        Err(e) => {
                            log::warn!("Failed to decode hub notification: {e}");
                        }
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(RelayEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Send a typed event to the hub.
    pub async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let frame = msg.encode()?;
        self.send_raw(frame).await
    }

    /// Send a raw text frame (protocol-violation tests use this).
    pub async fn send_raw(&self, frame: String) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Replace the shared buffer.
    pub async fn send_code(&self, code: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::CodeChange { code: code.into() }).await
    }

    /// Move the cursor.
    pub async fn send_cursor(&self, cursor: CursorPos) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::CursorMove { cursor }).await
    }

    /// Append to the chat log.
    pub async fn send_chat(&self, message: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Chat {
            message: message.into(),
        })
        .await
    }

    /// Change the display name.
    pub async fn send_name(&self, name: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::NameChange {
            new_name: name.into(),
        })
        .await
    }

    /// Close the connection. The server notices the close frame and runs
    /// its cleanup for this member.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = RelayClient::new("ws://127.0.0.1:9090", "room1");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.session_id(), "room1");
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let client = RelayClient::new("ws://127.0.0.1:9090", "room1");
        assert!(client.send_code("x = 1").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_server_fails() {
        // Port 9 (discard) is not listening on loopback.
        let mut client = RelayClient::new("ws://127.0.0.1:9", "room1");
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_builder_profile() {
        let client = RelayClient::new("ws://127.0.0.1:9090", "room1")
            .with_name("Alice")
            .with_initial_code("print(1)");
        assert_eq!(client.user_name.as_deref(), Some("Alice"));
        assert_eq!(client.initial_code.as_deref(), Some("print(1)"));
    }
}
