//! Process-wide session registry.
//!
//! Maps session ids to live sessions and enforces the lifecycle
//! invariant: a session is present in the registry if and only if it has
//! at least one member. Creation is lazy on first join; removal happens
//! atomically with the removal of the last member, so a join can never
//! land on a session that a concurrent leave just deleted.
//!
//! `get_or_create` / `remove_if_empty` are the primitives; `join` /
//! `leave` compose them with the membership change under a single write
//! scope, the same way the sync server holds its rooms lock across
//! room creation and peer admission.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::broadcast::Envelope;
use crate::session::{Member, Session, SessionSnapshot};

/// Registry errors.
#[derive(Debug, Clone)]
pub enum RegistryError {
    /// The session already holds the configured maximum of members.
    SessionFull { session_id: String, limit: usize },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionFull { session_id, limit } => {
                write!(f, "session `{session_id}` is full ({limit} members)")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Registry of active sessions.
///
/// Lifecycle operations (create, join, leave, remove) serialize on one
/// lock; steady-state session traffic never touches it, so distinct
/// sessions proceed fully in parallel.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    broadcast_capacity: usize,
    max_members_per_session: usize,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new(broadcast_capacity: usize, max_members_per_session: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            broadcast_capacity,
            max_members_per_session,
        }
    }

    /// Get the session for `session_id`, creating it atomically when
    /// unseen. Never exposes a partially-constructed session.
    pub async fn get_or_create(&self, session_id: &str) -> Arc<Session> {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(session_id) {
                return session.clone();
            }
        }

        // Slow path: write lock to create
        let mut sessions = self.sessions.write().await;
        // Double-check after acquiring write lock
        if let Some(session) = sessions.get(session_id) {
            return session.clone();
        }

        let session = Arc::new(Session::new(session_id, self.broadcast_capacity));
        sessions.insert(session_id.to_string(), session.clone());
        log::info!("Session `{session_id}` created");
        session
    }

    /// Remove the entry for `session_id` only when it has no members.
    /// The member count is re-checked under the write lock.
    pub async fn remove_if_empty(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(session_id) {
            if session.is_empty().await {
                sessions.remove(session_id);
                log::info!("Session `{session_id}` removed (empty)");
                return true;
            }
        }
        false
    }

    /// Admit `member` into `session_id`, creating the session when
    /// needed. The whole get-or-create + admission runs under the write
    /// lock, closing the window where a concurrent leave could delete the
    /// session between the two steps.
    pub async fn join(
        &self,
        session_id: &str,
        member: Member,
        initial_code: Option<String>,
    ) -> Result<(Arc<Session>, SessionSnapshot, broadcast::Receiver<Envelope>), RegistryError>
    {
        let mut sessions = self.sessions.write().await;
        let session = match sessions.get(session_id) {
            Some(session) => session.clone(),
            None => {
                let session = Arc::new(Session::new(session_id, self.broadcast_capacity));
                sessions.insert(session_id.to_string(), session.clone());
                log::info!("Session `{session_id}` created");
                session
            }
        };

        if session.member_count().await >= self.max_members_per_session {
            // A freshly created session can't be full, so no empty entry
            // is ever left behind here.
            return Err(RegistryError::SessionFull {
                session_id: session_id.to_string(),
                limit: self.max_members_per_session,
            });
        }

        let member_id = member.id;
        let (snapshot, receiver) = session.add_member(member, initial_code).await;
        log::info!(
            "Member {member_id} joined session `{session_id}` ({} members)",
            snapshot.users.len()
        );
        Ok((session, snapshot, receiver))
    }

    /// Remove `member_id` from `session_id` and drop the session when it
    /// became empty, all under the write lock. Idempotent: a duplicate
    /// leave returns `false` and notifies nobody.
    pub async fn leave(&self, session_id: &str, member_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        let session = match sessions.get(session_id) {
            Some(session) => session.clone(),
            None => return false,
        };

        let removed = session.remove_member(member_id).await;
        if session.is_empty().await {
            sessions.remove(session_id);
            log::info!("Session `{session_id}` removed (empty)");
        }
        if removed {
            log::info!("Member {member_id} left session `{session_id}`");
        }
        removed
    }

    /// Number of active sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether a session id is currently registered.
    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Ids of all active sessions.
    pub async fn active_sessions(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
