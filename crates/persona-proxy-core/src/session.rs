//! Session store: session id -> bounded, ordered window of conversation turns.
//! Volatile by design; lives as long as the process.

use crate::error::StoreError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message in a conversation. Order within a session is conversation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Narrow store interface injected into the orchestrator. A persistent or shared
/// implementation can replace the in-memory one without touching the pipeline.
pub trait SessionStore: Send + Sync {
    /// Return `id` when given (creating the session if unseen), else mint a fresh one.
    fn resolve(&self, id: Option<&str>) -> Result<SessionId, StoreError>;

    /// Append a turn, then drop the oldest turns beyond the window.
    fn append(&self, id: &str, turn: Turn) -> Result<(), StoreError>;

    /// Turns in conversation order. Unknown ids yield an empty history.
    fn read(&self, id: &str) -> Result<Vec<Turn>, StoreError>;
}

/// In-memory session store. Appends to one session are atomic individually, but a
/// read-then-append sequence spanning a backend call is not serialized per session.
pub struct InMemorySessionStore {
    sessions: DashMap<SessionId, VecDeque<Turn>>,
    max_turns: usize,
}

impl InMemorySessionStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_turns: max_turns.max(1),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl SessionStore for InMemorySessionStore {
    fn resolve(&self, id: Option<&str>) -> Result<SessionId, StoreError> {
        let id = match id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(existing) => existing.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        self.sessions.entry(id.clone()).or_default();
        Ok(id)
    }

    fn append(&self, id: &str, turn: Turn) -> Result<(), StoreError> {
        let mut turns = self.sessions.entry(id.to_string()).or_default();
        turns.push_back(turn);
        while turns.len() > self.max_turns {
            turns.pop_front();
        }
        Ok(())
    }

    fn read(&self, id: &str) -> Result<Vec<Turn>, StoreError> {
        Ok(self
            .sessions
            .get(id)
            .map(|turns| turns.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_keeps_given_id() {
        let store = InMemorySessionStore::new(4);
        assert_eq!(store.resolve(Some("abc")).unwrap(), "abc");
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn resolve_mints_unique_ids() {
        let store = InMemorySessionStore::new(4);
        let a = store.resolve(None).unwrap();
        let b = store.resolve(Some("   ")).unwrap();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn read_unknown_is_empty() {
        let store = InMemorySessionStore::new(4);
        assert!(store.read("nobody").unwrap().is_empty());
    }

    #[test]
    fn append_evicts_oldest_first() {
        let store = InMemorySessionStore::new(3);
        for i in 0..5 {
            store.append("s", Turn::user(format!("m{}", i))).unwrap();
            assert!(store.read("s").unwrap().len() <= 3);
        }
        let contents: Vec<String> = store
            .read("s")
            .unwrap()
            .into_iter()
            .map(|t| t.content)
            .collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn sessions_are_independent() {
        let store = InMemorySessionStore::new(3);
        store.append("a", Turn::user("hi")).unwrap();
        store.append("b", Turn::assistant("yo")).unwrap();
        assert_eq!(store.read("a").unwrap(), vec![Turn::user("hi")]);
        assert_eq!(store.read("b").unwrap(), vec![Turn::assistant("yo")]);
    }
}
