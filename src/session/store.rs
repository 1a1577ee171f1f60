//! Server-side session storage

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::Result;
use crate::session::SessionData;

/// Persists [`SessionData`] by session id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Loads the session for `sid`, if it exists.
    async fn get(&self, sid: &str) -> Result<Option<SessionData>>;

    /// Stores a new session and returns its id.
    async fn set(&self, data: SessionData) -> Result<String>;

    /// Replaces the data for `sid` and extends its lifetime.
    async fn touch(&self, sid: &str, data: SessionData) -> Result<()>;

    /// Deletes the session for `sid`.
    async fn destroy(&self, sid: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredSession {
    data: SessionData,
    expires_at: Option<DateTime<Utc>>,
}

/// In-process session store with a sliding TTL.
///
/// Session ids are random UUIDs. Expired entries are dropped on access.
#[derive(Debug)]
pub struct MemorySessionStore {
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    sessions: Mutex<HashMap<String, StoredSession>>,
}

impl MemorySessionStore {
    /// Creates a store whose entries live for `ttl` after their last write.
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            clock,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut sessions = self.lock();
        sessions.retain(|_, s| is_live(s, now));
        sessions.len()
    }

    /// True when no live sessions remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stored(&self, data: SessionData) -> StoredSession {
        StoredSession {
            data,
            expires_at: self.clock.now().checked_add_signed(self.ttl),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_live(session: &StoredSession, now: DateTime<Utc>) -> bool {
    session.expires_at.map_or(true, |at| now < at)
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, sid: &str) -> Result<Option<SessionData>> {
        let now = self.clock.now();
        let mut sessions = self.lock();
        match sessions.get(sid) {
            Some(s) if is_live(s, now) => Ok(Some(s.data.clone())),
            Some(_) => {
                sessions.remove(sid);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, data: SessionData) -> Result<String> {
        let sid = uuid::Uuid::new_v4().to_string();
        let stored = self.stored(data);
        self.lock().insert(sid.clone(), stored);
        Ok(sid)
    }

    async fn touch(&self, sid: &str, data: SessionData) -> Result<()> {
        let stored = self.stored(data);
        self.lock().insert(sid.to_string(), stored);
        Ok(())
    }

    async fn destroy(&self, sid: &str) -> Result<()> {
        self.lock().remove(sid);
        Ok(())
    }
}
