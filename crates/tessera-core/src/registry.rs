//! Process-wide map of live sessions.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::SessionError;
use crate::packet::{Payload, SessionId};
use crate::session::Session;

/// Live sessions by id. Cloning shares the same map.
///
/// A session is registered when it is created through a registry and removed
/// on its own worker as part of its close transition.
pub struct SessionRegistry<M: Payload> {
    sessions: Arc<RwLock<HashMap<SessionId, Session<M>>>>,
}

impl<M: Payload> Clone for SessionRegistry<M> {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
        }
    }
}

impl<M: Payload> Default for SessionRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Payload> std::fmt::Debug for SessionRegistry<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}

impl<M: Payload> SessionRegistry<M> {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register(&self, session: Session<M>) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(session.id()) {
            return Err(SessionError::DuplicateId(session.id().to_string()));
        }
        sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> Option<Session<M>> {
        self.sessions.write().remove(id)
    }

    /// Remove `session` only if the entry under its id is that very session.
    pub(crate) fn remove_exact(&self, session: &Session<M>) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(session.id()) {
            Some(current) if current.same_session(session) => {
                sessions.remove(session.id());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Session<M>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Gracefully close every registered session. Sessions unregister
    /// themselves as their teardown completes.
    pub fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        for session in sessions {
            session.close();
        }
    }
}
