// Shared credential cache
// In-process implementation of the cache protocol, partitioned per identity session

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::store::CredentialStore;

/// Scope used when a caller does not name an identity session
pub const DEFAULT_SCOPE: &str = "anonymous";

/// Thread-safe key-value cache shared by every handler and gate
///
/// Entries have no TTL: they live until explicitly deleted or overwritten.
/// Writes are last-writer-wins.
#[derive(Clone, Default)]
pub struct SharedCache {
    /// Values indexed by (session scope, key)
    entries: Arc<DashMap<(String, String), String>>,
}

impl SharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, scope: &str, key: &str) -> Option<String> {
        self.entries
            .get(&(scope.to_string(), key.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn set(&self, scope: &str, key: &str, value: &str) {
        self.entries
            .insert((scope.to_string(), key.to_string()), value.to_string());
        tracing::debug!(scope = %scope, key = %key, "Cache entry written");
    }

    /// Returns whether an entry was removed
    pub fn delete(&self, scope: &str, key: &str) -> bool {
        let removed = self
            .entries
            .remove(&(scope.to_string(), key.to_string()))
            .is_some();
        tracing::debug!(scope = %scope, key = %key, removed, "Cache entry deleted");
        removed
    }

    /// Number of entries across all scopes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// View of the cache bound to one session, usable as a [`CredentialStore`]
    pub fn scoped(&self, scope: impl Into<String>) -> ScopedCache {
        ScopedCache {
            cache: self.clone(),
            scope: scope.into(),
        }
    }
}

/// [`SharedCache`] restricted to a single session scope
#[derive(Clone)]
pub struct ScopedCache {
    cache: SharedCache,
    scope: String,
}

#[async_trait]
impl CredentialStore for ScopedCache {
    async fn get(&self, key: &str) -> Option<String> {
        self.cache.get(&self.scope, key)
    }

    async fn set(&self, key: &str, value: &str) -> bool {
        self.cache.set(&self.scope, key, value);
        true
    }

    async fn delete(&self, key: &str) -> bool {
        // Deleting an absent key leaves the store in the requested state
        self.cache.delete(&self.scope, key);
        true
    }

    fn namespace(&self) -> &str {
        &self.scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete_round_trip() {
        let cache = SharedCache::new();
        let store = cache.scoped("session-a");

        assert!(store.set("primary_auth", "value-1").await);
        assert_eq!(store.get("primary_auth").await.as_deref(), Some("value-1"));

        assert!(store.delete("primary_auth").await);
        assert_eq!(store.get("primary_auth").await, None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_is_last_writer_wins() {
        let cache = SharedCache::new();
        let store = cache.scoped("session-a");

        store.set("primary_auth", "first").await;
        store.set("primary_auth", "second").await;
        assert_eq!(store.get("primary_auth").await.as_deref(), Some("second"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let cache = SharedCache::new();
        let a = cache.scoped("session-a");
        let b = cache.scoped("session-b");

        a.set("auth_provider", "secondary").await;
        assert_eq!(b.get("auth_provider").await, None);
        assert_eq!(a.namespace(), "session-a");
        assert_eq!(cache.get("session-a", "auth_provider").as_deref(), Some("secondary"));
    }

    #[test]
    fn test_delete_missing_key() {
        let cache = SharedCache::new();
        assert!(!cache.delete(DEFAULT_SCOPE, "nothing"));
    }
}
