//! Fan-out broadcast to a session's members with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each member's connection owns an independent receiver that buffers up
//! to `capacity` envelopes; a slow or broken recipient lags and drops its
//! own backlog without delaying anyone else.
//!
//! Sends are synchronous, so callers that broadcast while holding their
//! session's state lock define a single total order that every receiver
//! observes (see `session::Session`).
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

/// One pre-encoded notification in flight to a session's members.
///
/// The payload is encoded once per broadcast and shared by reference;
/// `exclude` names the member whose connection must skip delivery
/// (the originator of an others-only event).
#[derive(Debug, Clone)]
pub struct Envelope {
    pub exclude: Option<Uuid>,
    pub payload: Arc<String>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_receivers: usize,
}

/// Atomic broadcast stats — lock-free on the hot path.
#[derive(Debug)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Per-session broadcaster.
///
/// All members of a session share one channel; every notification is
/// fanned out to N receivers and filtered against `Envelope::exclude`
/// on the receiving side.
#[derive(Debug)]
pub struct Broadcaster {
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl Broadcaster {
    /// Create a new broadcaster with the given per-receiver buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Subscribe a new receiver.
    ///
    /// Only envelopes sent after this call are delivered, which is why
    /// `Session::add_member` subscribes under the same lock that builds
    /// the join snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Broadcast `event` to every subscriber, excluding at most one member.
    ///
    /// The event is encoded exactly once. Returns the number of receivers
    /// the envelope was handed to; zero when the session has no listeners
    /// (not an error — fire-and-forget semantics).
    pub fn broadcast(
        &self,
        event: &ServerMessage,
        exclude: Option<Uuid>,
    ) -> Result<usize, ProtocolError> {
        let payload = Arc::new(event.encode()?);
        let count = self
            .sender
            .send(Envelope { exclude, payload })
            .unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    /// Record envelopes a lagging receiver had to drop.
    pub fn note_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Number of currently subscribed receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Per-receiver buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_receivers: self.sender.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let bc = Broadcaster::new(16);
        let mut rx1 = bc.subscribe();
        let mut rx2 = bc.subscribe();
        let mut rx3 = bc.subscribe();

        let user = Uuid::new_v4();
        let count = bc
            .broadcast(
                &ServerMessage::CodeUpdate {
                    user_id: user,
                    code: "x = 1".into(),
                },
                Some(user),
            )
            .unwrap();

        // All 3 receivers get the envelope — exclusion is the receiver's job.
        assert_eq!(count, 3);
        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let env = rx.recv().await.unwrap();
            assert_eq!(env.exclude, Some(user));
            assert!(env.payload.contains("code-update"));
        }
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers_is_not_an_error() {
        let bc = Broadcaster::new(16);
        let count = bc
            .broadcast(&ServerMessage::error("nobody home"), None)
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(bc.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_receivers_observe_same_order() {
        let bc = Broadcaster::new(64);
        let mut rx1 = bc.subscribe();
        let mut rx2 = bc.subscribe();

        let user = Uuid::new_v4();
        for i in 0..10 {
            bc.broadcast(
                &ServerMessage::CodeUpdate {
                    user_id: user,
                    code: format!("v{i}"),
                },
                None,
            )
            .unwrap();
        }

        for rx in [&mut rx1, &mut rx2] {
            for i in 0..10 {
                let env = rx.recv().await.unwrap();
                assert!(env.payload.contains(&format!("v{i}")));
            }
        }
    }

    #[tokio::test]
    async fn test_lagging_receiver_is_isolated() {
        let bc = Broadcaster::new(4);
        let mut slow = bc.subscribe();
        let mut fast = bc.subscribe();

        for i in 0..8 {
            bc.broadcast(
                &ServerMessage::CodeUpdate {
                    user_id: Uuid::new_v4(),
                    code: format!("v{i}"),
                },
                None,
            )
            .unwrap();
            // The fast receiver keeps up.
            let env = fast.recv().await.unwrap();
            assert!(env.payload.contains(&format!("v{i}")));
        }

        // The slow receiver overflowed its own buffer and lags, but the
        // newest envelopes are still there for it.
        match slow.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                bc.note_dropped(n);
                assert!(n > 0);
            }
            other => panic!("expected Lagged, got {other:?}"),
        }
        assert!(slow.recv().await.is_ok());
        assert!(bc.stats().messages_dropped > 0);
    }

    #[tokio::test]
    async fn test_subscribe_only_sees_later_broadcasts() {
        let bc = Broadcaster::new(16);
        let _early = bc.subscribe(); // keep the channel alive
        bc.broadcast(&ServerMessage::error("before"), None).unwrap();

        let mut late = bc.subscribe();
        bc.broadcast(&ServerMessage::error("after"), None).unwrap();

        let env = late.recv().await.unwrap();
        assert!(env.payload.contains("after"));
    }

    #[tokio::test]
    async fn test_capacity() {
        let bc = Broadcaster::new(32);
        assert_eq!(bc.capacity(), 32);
        assert_eq!(bc.receiver_count(), 0);
    }
}
