//! # duet-collab — real-time collaboration relay
//!
//! Multiple participants connect to a named session and jointly observe
//! a shared code buffer, cursor positions, and a chat log. Every edit
//! and presence event is fanned out to the other members of the same
//! session in one consistent order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ RelayClient │ ◄─────────────────► │ RelayServer  │
//! │ (per user)  │     JSON frames     │ (central)    │
//! └─────────────┘                     └──────┬───────┘
//!                                            │
//!                                   ┌────────┴────────┐
//!                                   │ SessionRegistry │  get_or_create /
//!                                   └────────┬────────┘  remove_if_empty
//!                                            │
//!                                      ┌─────┴─────┐
//!                                      │  Session  │  members / code / chat
//!                                      └─────┬─────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │ Broadcaster │  ordered fan-out
//!                                     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (`type`-tagged messages)
//! - [`session`] — per-session shared state with serialized mutations
//! - [`broadcast`] — per-session fan-out with per-recipient isolation
//! - [`registry`] — atomic session lifecycle management
//! - [`router`] — inbound event dispatch and error classification
//! - [`server`] — WebSocket relay server and connection lifecycle
//! - [`client`] — WebSocket relay client
//!
//! ## Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | Per-session total order | mutation + broadcast under one lock |
//! | Session iff members ≥ 1 | registry write lock spans both steps |
//! | Slow peers isolated | bounded per-receiver broadcast buffers |
//! | Cleanup on every exit | drop guard around session membership |

pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, Broadcaster, Envelope};
pub use client::{ConnectionState, RelayClient, RelayEvent};
pub use protocol::{
    ChatMessage, ClientMessage, CursorPos, ProtocolError, ServerMessage, UserView,
};
pub use registry::{RegistryError, SessionRegistry};
pub use router::{MessageRouter, RouteError};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use session::{Member, Session, SessionSnapshot};
