//! WebSocket relay server with session-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Session (room id) ── shared state ── Broadcaster
//! Client B ──┘          │                                  │
//!                SessionRegistry                ┌──────────┼──────────┐
//!             (create / remove, atomic)         ▼          ▼          ▼
//!                                            Client A   Client B   Client C
//! ```
//!
//! Each connection runs as its own task and drives the
//! join → active → terminated lifecycle:
//! - the WebSocket URL path names the session;
//! - the first inbound frame admits the member (a leading `join` frame
//!   contributes its profile and initial code atomically, any other
//!   first frame joins with defaults before being routed);
//! - inbound events go through the `MessageRouter`, outbound
//!   notifications arrive on the member's broadcast receiver;
//! - a drop guard guarantees the leave path runs exactly once on every
//!   exit, normal or not.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::Envelope;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::SessionRegistry;
use crate::router::MessageRouter;
use crate::session::{Member, Session};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast buffer capacity per member connection
    pub broadcast_capacity: usize,
    /// Maximum members per session
    pub max_members_per_session: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_members_per_session: 100,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub active_sessions: usize,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    /// Create a new relay server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.broadcast_capacity,
            config.max_members_per_session,
        ));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // The session id comes out-of-band: it is the URL path of the
        // WebSocket handshake (clients connect to ws://host/<session-id>).
        let mut requested_session: Option<String> = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match req.uri().path().rsplit('/').find(|seg| !seg.is_empty()) {
                Some(seg) => {
                    requested_session = Some(seg.to_string());
                    Ok(resp)
                }
                None => {
                    let mut err =
                        ErrorResponse::new(Some("session id required in the URL path".to_string()));
                    *err.status_mut() = StatusCode::BAD_REQUEST;
                    Err(err)
                }
            }
        })
        .await?;

        let session_id = match requested_session {
            Some(id) => id,
            // The handshake callback rejects path-less requests, so this
            // connection never reached the upgraded state.
            None => return Ok(()),
        };

        log::info!("WebSocket connection established from {addr} for session `{session_id}`");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let router = MessageRouter;

        // State for this connection
        let mut membership: Option<(Arc<Session>, Uuid)> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Envelope>> = None;
        let mut guard = ConnectionGuard::new(registry.clone(), stats.clone(), session_id.clone());

        loop {
            tokio::select! {
                // Incoming WebSocket message
                inbound = ws_receiver.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                            }

                            if let Some((session, member_id)) = &membership {
                                if let Err(route_err) =
                                    router.route(session, *member_id, text.as_str()).await
                                {
                                    log::debug!("Rejected frame from {addr}: {route_err}");
                                    if !send_error(&mut ws_sender, route_err.to_string()).await {
                                        break;
                                    }
                                }
                            } else {
                                let msg = match router.parse(text.as_str()) {
                                    Ok(msg) => msg,
                                    Err(route_err) => {
                                        log::debug!("Rejected frame from {addr}: {route_err}");
                                        if !send_error(&mut ws_sender, route_err.to_string()).await {
                                            break;
                                        }
                                        continue;
                                    }
                                };

                                // First frame: admit the member. A leading
                                // `join` contributes its profile and seed
                                // atomically; anything else joins with
                                // defaults and is then routed normally.
                                let (join_name, join_code, followup) = match msg {
                                    ClientMessage::Join { user_name, initial_code } => {
                                        (user_name, initial_code, None)
                                    }
                                    other => (None, None, Some(other)),
                                };

                                let mut member = Member::new();
                                member.name = join_name;
                                let member_id = member.id;
                                let color = member.color.clone();

                                let (session, snapshot, rx) =
                                    match registry.join(&session_id, member, join_code).await {
                                        Ok(joined) => joined,
                                        Err(e) => {
                                            log::warn!("Join rejected for {addr}: {e}");
                                            let _ = send_error(&mut ws_sender, e.to_string()).await;
                                            break;
                                        }
                                    };
                                guard.set_member(member_id);

                                {
                                    let active_sessions = registry.session_count().await;
                                    let mut s = stats.write().await;
                                    s.active_sessions = active_sessions;
                                }

                                let joined = ServerMessage::Joined {
                                    session_id: session_id.clone(),
                                    user_id: member_id,
                                    color,
                                    users: snapshot.users,
                                    code: snapshot.code,
                                    chat_messages: snapshot.chat_messages,
                                };
                                match joined.encode() {
                                    Ok(frame) => {
                                        if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        log::error!("Failed to encode joined reply: {e}");
                                        break;
                                    }
                                }

                                if let Some(followup) = followup {
                                    router.dispatch(&session, member_id, followup).await;
                                }

                                log::info!(
                                    "Member {member_id} active in session `{session_id}` from {addr}"
                                );
                                membership = Some((session, member_id));
                                broadcast_rx = Some(rx);
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            log::debug!("Rejected binary frame from {addr}");
                            if !send_error(&mut ws_sender, "binary frames are not supported").await {
                                break;
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing notification from the session
                outbound = async {
                    match broadcast_rx {
                        Some(ref mut rx) => rx.recv().await,
                        // Not joined yet — wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match outbound {
                        Ok(env) => {
                            let own_id = membership.as_ref().map(|(_, id)| *id);
                            if env.exclude.is_some() && env.exclude == own_id {
                                continue;
                            }
                            if ws_sender
                                .send(Message::Text(env.payload.as_str().into()))
                                .await
                                .is_err()
                            {
                                log::warn!("Delivery to {addr} failed, closing its connection");
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            if let Some((session, member_id)) = &membership {
                                session.broadcaster().note_dropped(n);
                                log::warn!("Member {member_id} lagged by {n} notifications");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        guard.leave().await;
        log::info!("Connection from {addr} terminated");
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the session registry.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }
}

/// Send an `error` notification to the connection's own socket.
///
/// Returns whether the socket is still usable.
async fn send_error<S>(sender: &mut S, message: impl Into<String>) -> bool
where
    S: futures_util::Sink<Message> + Unpin,
{
    match ServerMessage::error(message).encode() {
        Ok(frame) => sender.send(Message::Text(frame.into())).await.is_ok(),
        Err(e) => {
            log::error!("Failed to encode error reply: {e}");
            true
        }
    }
}

/// Guaranteed-cleanup guard for one connection's session membership.
///
/// The normal path calls `leave()`, which disarms the guard and runs the
/// cleanup inline. If the handler unwinds or its task is cancelled first,
/// `Drop` spawns the same cleanup instead. Either way it runs at most
/// once.
struct ConnectionGuard {
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<ServerStats>>,
    session_id: String,
    member_id: Option<Uuid>,
    armed: bool,
}

impl ConnectionGuard {
    fn new(
        registry: Arc<SessionRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        session_id: String,
    ) -> Self {
        Self {
            registry,
            stats,
            session_id,
            member_id: None,
            armed: true,
        }
    }

    /// Record the member this connection admitted.
    fn set_member(&mut self, member_id: Uuid) {
        self.member_id = Some(member_id);
    }

    /// Run the cleanup now and disarm the drop path.
    async fn leave(mut self) {
        self.armed = false;
        let registry = self.registry.clone();
        let stats = self.stats.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let member_id = self.member_id;
        drop(self);
        cleanup(registry, stats, session_id, member_id).await;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let registry = self.registry.clone();
        let stats = self.stats.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let member_id = self.member_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(cleanup(registry, stats, session_id, member_id));
        }
    }
}

/// Terminal cleanup for a connection: remove the member (notifying the
/// remaining ones), drop the session when it became empty, and settle
/// the connection stats.
async fn cleanup(
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<ServerStats>>,
    session_id: String,
    member_id: Option<Uuid>,
) {
    if let Some(member_id) = member_id {
        registry.leave(&session_id, member_id).await;
    }
    let active_sessions = registry.session_count().await;
    let mut s = stats.write().await;
    s.active_connections = s.active_connections.saturating_sub(1);
    s.active_sessions = active_sessions;
}
