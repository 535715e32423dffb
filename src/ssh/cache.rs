//! Process-wide registry of live, authenticated sessions.
//!
//! Keyed by `(host, user)` only: two requests with the same identity but
//! different auth material share the slot, and the first successful
//! authentication wins for the lifetime of the cache entry. Deliberate
//! policy, not a defect.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

/// Cache key for one remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    pub host: String,
    pub user: String,
}

impl ConnectionIdentity {
    #[must_use]
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
        }
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// Map from [`ConnectionIdentity`] to a live session handle.
///
/// Entries have no TTL; they persist until evicted or the process exits.
/// Constructed once per process and passed by reference to whatever needs it,
/// never ambient global state.
pub struct ConnectionCache<S> {
    sessions: Mutex<HashMap<ConnectionIdentity, S>>,
}

impl<S: Clone> ConnectionCache<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached session for `identity`, or run `factory` and cache
    /// its result.
    ///
    /// The map lock is deliberately not held across the factory call, so two
    /// concurrent callers for the same identity may both handshake; the
    /// second insert silently replaces the first. Accepted limitation: the
    /// transport's callers drive one identity from one logical task.
    ///
    /// # Errors
    ///
    /// Propagates the factory's error; nothing is cached on failure.
    pub async fn get_or_create<F, Fut>(
        &self,
        identity: &ConnectionIdentity,
        factory: F,
    ) -> Result<S>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        if let Some(session) = self.sessions.lock().await.get(identity) {
            debug!(identity = %identity, "reusing cached session");
            return Ok(session.clone());
        }

        let session = factory().await?;
        self.sessions
            .lock()
            .await
            .insert(identity.clone(), session.clone());
        Ok(session)
    }

    /// Remove the entry for `identity` without closing it; closing the
    /// underlying session is the caller's responsibility.
    pub async fn evict(&self, identity: &ConnectionIdentity) -> Option<S> {
        self.sessions.lock().await.remove(identity)
    }

    pub async fn contains(&self, identity: &ConnectionIdentity) -> bool {
        self.sessions.lock().await.contains_key(identity)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

impl<S: Clone> Default for ConnectionCache<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_identity_display() {
        let id = ConnectionIdentity::new("web1", "deploy");
        assert_eq!(format!("{id}"), "deploy@web1");
    }

    #[test]
    fn test_identity_equality_and_hash() {
        let a = ConnectionIdentity::new("web1", "deploy");
        let b = ConnectionIdentity::new("web1", "deploy");
        let c = ConnectionIdentity::new("web1", "root");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
        assert_eq!(map.get(&c), None);
    }

    #[tokio::test]
    async fn test_factory_invoked_exactly_once_for_repeated_gets() {
        let cache: ConnectionCache<u32> = ConnectionCache::new();
        let id = ConnectionIdentity::new("web1", "deploy");
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        for _ in 0..3 {
            let session = cache
                .get_or_create(&id, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
            assert_eq!(session, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_factory_failure_caches_nothing() {
        let cache: ConnectionCache<u32> = ConnectionCache::new();
        let id = ConnectionIdentity::new("web1", "deploy");

        let err = cache
            .get_or_create(&id, || async {
                Err(TransportError::Connection {
                    host: "web1".to_string(),
                    reason: "refused".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connection { .. }));
        assert!(!cache.contains(&id).await);

        // A later attempt runs the factory again.
        let session = cache.get_or_create(&id, || async { Ok(9) }).await.unwrap();
        assert_eq!(session, 9);
    }

    #[tokio::test]
    async fn test_distinct_identities_get_distinct_slots() {
        let cache: ConnectionCache<u32> = ConnectionCache::new();
        let a = ConnectionIdentity::new("web1", "deploy");
        let b = ConnectionIdentity::new("web1", "root");

        cache.get_or_create(&a, || async { Ok(1) }).await.unwrap();
        cache.get_or_create(&b, || async { Ok(2) }).await.unwrap();

        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get_or_create(&a, || async { Ok(99) }).await.unwrap(), 1);
        assert_eq!(cache.get_or_create(&b, || async { Ok(99) }).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_evict_removes_without_closing() {
        let cache: ConnectionCache<u32> = ConnectionCache::new();
        let id = ConnectionIdentity::new("web1", "deploy");

        cache.get_or_create(&id, || async { Ok(5) }).await.unwrap();
        assert_eq!(cache.evict(&id).await, Some(5));
        assert!(cache.is_empty().await);
        assert_eq!(cache.evict(&id).await, None);
    }

    #[tokio::test]
    async fn test_get_after_evict_reinvokes_factory() {
        let cache: ConnectionCache<u32> = ConnectionCache::new();
        let id = ConnectionIdentity::new("web1", "deploy");
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let factory = || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        };
        cache.get_or_create(&id, factory).await.unwrap();
        cache.evict(&id).await;
        cache
            .get_or_create(&id, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
