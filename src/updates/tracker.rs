//! Shared registry of containers with an update in flight
//!
//! The auto-restart loop consults this before touching a container, so
//! the update executor can stop, replace and (on rollback) remove
//! containers without the restarter racing it. Both the old and the new
//! composite key are registered from the moment the new container is
//! created until teardown.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::keys::make_composite_key;

#[derive(Default)]
pub struct UpdatingContainers {
    keys: Mutex<HashSet<String>>,
}

impl UpdatingContainers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, composite_key: &str) {
        self.keys.lock().insert(composite_key.to_string());
    }

    /// Remove a key; idempotent.
    pub fn remove(&self, composite_key: &str) {
        self.keys.lock().remove(composite_key);
    }

    pub fn contains(&self, composite_key: &str) -> bool {
        self.keys.lock().contains(composite_key)
    }

    /// Convenience for callers holding `(host_id, short_id)` pairs.
    pub fn is_container_updating(&self, host_id: &str, short_id: &str) -> bool {
        match make_composite_key(host_id, short_id) {
            Ok(key) => self.contains(&key),
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_contains_remove() {
        let tracker = UpdatingContainers::new();
        tracker.insert("h1:abc123def456");
        assert!(tracker.contains("h1:abc123def456"));
        assert!(tracker.is_container_updating("h1", "abc123def456"));
        assert!(!tracker.is_container_updating("h2", "abc123def456"));

        tracker.remove("h1:abc123def456");
        tracker.remove("h1:abc123def456"); // idempotent
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_bad_key_is_not_updating() {
        let tracker = UpdatingContainers::new();
        assert!(!tracker.is_container_updating("", "abc123def456"));
        assert!(!tracker.is_container_updating("h1", "short"));
    }
}
