//! Pending authorization attempts keyed by `state`
//!
//! Entries are single use: [`StateStore::take`] removes the entry it
//! returns. Entries older than the configured TTL are treated as absent and
//! purged on every access.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crate::clock::Clock;

/// What was generated for one authorization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEntry {
    /// Nonce sent in the authorization request.
    pub nonce: String,
    /// PKCE verifier, when PKCE was used.
    pub code_verifier: Option<String>,
    /// When the attempt was started.
    pub created_at: DateTime<Utc>,
}

/// Time-bounded, single-use store of [`StateEntry`] values.
#[derive(Debug)]
pub struct StateStore {
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    entries: Mutex<HashMap<String, StateEntry>>,
}

impl StateStore {
    /// Creates an empty store whose entries live for `ttl`.
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            clock,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Records a new attempt under `state` and returns its entry.
    pub fn insert(
        &self,
        state: impl Into<String>,
        nonce: impl Into<String>,
        code_verifier: Option<String>,
    ) -> StateEntry {
        let entry = StateEntry {
            nonce: nonce.into(),
            code_verifier,
            created_at: self.clock.now(),
        };
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge(&mut entries);
        entries.insert(state.into(), entry.clone());
        entry
    }

    /// Removes and returns the entry for `state` if it exists and has not
    /// expired.
    pub fn take(&self, state: &str) -> Option<StateEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge(&mut entries);
        entries.remove(state)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge(&mut entries);
        entries.len()
    }

    /// True when no live entries remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge(&self, entries: &mut HashMap<String, StateEntry>) {
        let now = self.clock.now();
        entries.retain(|_, e| now - e.created_at <= self.ttl);
    }
}
