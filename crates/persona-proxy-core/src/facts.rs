//! Fact store: (session id, subject) -> free-text fact taught by the user.

use crate::error::StoreError;
use dashmap::DashMap;

/// Subjects are matched case-insensitively; this is the stored form.
pub fn normalize_subject(subject: &str) -> String {
    subject.trim().to_lowercase()
}

pub trait FactStore: Send + Sync {
    /// Store `fact` for `subject` in this session, replacing any earlier fact.
    fn learn(&self, session: &str, subject: &str, fact: &str) -> Result<(), StoreError>;

    /// `Ok(None)` when the session never learned the subject.
    fn lookup(&self, session: &str, subject: &str) -> Result<Option<String>, StoreError>;
}

/// In-memory fact table. Keys carry the session id, so nothing leaks across sessions.
#[derive(Default)]
pub struct InMemoryFactStore {
    facts: DashMap<(String, String), String>,
}

impl InMemoryFactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

impl FactStore for InMemoryFactStore {
    fn learn(&self, session: &str, subject: &str, fact: &str) -> Result<(), StoreError> {
        self.facts.insert(
            (session.to_string(), normalize_subject(subject)),
            fact.trim().to_string(),
        );
        Ok(())
    }

    fn lookup(&self, session: &str, subject: &str) -> Result<Option<String>, StoreError> {
        let key = (session.to_string(), normalize_subject(subject));
        Ok(self.facts.get(&key).map(|fact| fact.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let store = InMemoryFactStore::new();
        store.learn("s1", "Pluto", "a dwarf planet").unwrap();
        assert_eq!(
            store.lookup("s1", "  PLUTO ").unwrap().as_deref(),
            Some("a dwarf planet")
        );
    }

    #[test]
    fn relearning_overwrites() {
        let store = InMemoryFactStore::new();
        store.learn("s1", "pluto", "a planet").unwrap();
        store.learn("s1", "pluto", "a dwarf planet").unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup("s1", "pluto").unwrap().as_deref(), Some("a dwarf planet"));
    }

    #[test]
    fn facts_do_not_cross_sessions() {
        let store = InMemoryFactStore::new();
        store.learn("a", "bob", "my neighbour").unwrap();
        assert!(store.lookup("b", "bob").unwrap().is_none());
    }
}
