//! Registry of live sessions.
//!
//! Sessions are added on accept and removed once their receive loop has
//! handed the proxy back. The registry is only used for bookkeeping: status
//! reporting, external close requests and shutdown. The data path never
//! touches it.

use crate::runtime::session::{AppSession, CloseReason, Session, SessionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Session>>,
    next_id: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the id for the next accepted connection.
    pub fn next_id(&self) -> SessionId {
        SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert(&self, session: Session) {
        self.sessions.lock().insert(session.id(), session);
    }

    pub fn remove(&self, id: SessionId) -> Option<Session> {
        self.sessions.lock().remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Ids of live sessions, sorted.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Close one session. Returns `false` if it is unknown or already closing.
    pub fn close(&self, id: SessionId, reason: CloseReason) -> bool {
        // Close outside the lock.
        match self.get(id) {
            Some(session) => session.close(reason),
            None => false,
        }
    }

    /// Close every live session. Returns how many closes this call initiated.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let sessions: Vec<Session> = self.sessions.lock().values().cloned().collect();
        sessions
            .iter()
            .filter(|session| session.close(reason))
            .count()
    }
}
