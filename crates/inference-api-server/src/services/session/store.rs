use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::types::Session;
use crate::config::SessionsConfig;

/// Process-wide session registry. Sessions are created lazily on first
/// reference and destroyed only by `reclaim`. The map sits behind a single
/// store-level lock; reclamation decisions are computed without that lock
/// held, so an in-flight stream holding its session lock can never deadlock
/// against the store.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    ttl: Duration,
    max_sessions: usize,
    buffer_capacity: usize,
}

impl SessionStore {
    pub fn new(config: &SessionsConfig) -> Self {
        info!(
            "Initializing session store (ttl={}s, max_sessions={}, buffer={})",
            config.ttl_seconds, config.max_sessions, config.buffer_capacity
        );
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(config.ttl_seconds),
            max_sessions: config.max_sessions,
            buffer_capacity: config.buffer_capacity,
        }
    }

    pub fn get_or_create(&self, id: &str) -> Arc<Session> {
        let mut sessions = self.sessions.lock();
        sessions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Session::new(id, self.buffer_capacity)))
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Drop all sessions. Intended for shutdown and test isolation.
    pub fn reset(&self) {
        self.sessions.lock().clear();
    }

    /// Apply the age/count policy: expire sessions older than the TTL,
    /// finished sessions older than TTL/4, then evict oldest-created entries
    /// beyond `max_sessions`.
    pub fn reclaim(&self) {
        // Snapshot under the lock, decide outside it.
        let snapshot: Vec<(String, Arc<Session>)> = self
            .sessions
            .lock()
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();

        let mut expired: Vec<String> = Vec::new();
        let mut live: Vec<(String, Arc<Session>)> = Vec::new();
        for (id, session) in snapshot {
            let age = session.age();
            if age > self.ttl || (session.is_finished() && age > self.ttl / 4) {
                expired.push(id);
            } else {
                live.push((id, session));
            }
        }

        let mut evicted: Vec<String> = Vec::new();
        if live.len() > self.max_sessions {
            live.sort_by_key(|(_, s)| s.created_at());
            evicted = live
                .drain(..live.len() - self.max_sessions)
                .map(|(id, _)| id)
                .collect();
        }

        if expired.is_empty() && evicted.is_empty() {
            return;
        }

        let removed = expired.len() + evicted.len();
        let mut sessions = self.sessions.lock();
        for id in expired.into_iter().chain(evicted) {
            sessions.remove(&id);
        }
        debug!("Reclaimed {} sessions, {} remain", removed, sessions.len());
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.sessions
            .lock()
            .insert(session.id.clone(), session.clone());
        session
    }
}
