//! User identity resolution.
//!
//! Identity fields never block payload completion on the network: a cached
//! identity record short-circuits them, and when no record exists a
//! generated anonymous identifier stands in. The cache itself is owned by
//! an identity-resolution collaborator outside this crate; the engine only
//! depends on the [`IdentityStore`] capability.

use std::sync::{Arc, OnceLock, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::observer::record::NetworkRequest;

/// Payload field name a rule uses to request the signed-in user identity.
pub const USER_ID_FIELD: &str = "userId";

/// Payload field name identity falls back to when no user is known.
pub const ANONYMOUS_ID_FIELD: &str = "anonymousId";

/// One cached identity record: which field it fills and its value.
///
/// The field name travels with the value so a cached `username` can stand
/// in for a required `userId` (the context's required-field name is swapped
/// accordingly).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedIdentity {
    /// Payload field name this record fills.
    pub field: String,
    /// Identity value.
    pub value: String,
}

impl CachedIdentity {
    /// Creates a record.
    #[must_use]
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Host-persisted identity cache.
///
/// Backed by a persistent key-value store on the host; in-memory for tests
/// via [`MemoryIdentityStore`].
pub trait IdentityStore: Send + Sync {
    /// The cached identity, if any.
    fn get(&self) -> Option<CachedIdentity>;

    /// Persists an identity record.
    fn save(&self, identity: &CachedIdentity);
}

/// In-memory identity store for tests and embedded hosts.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    slot: RwLock<Option<CachedIdentity>>,
}

impl MemoryIdentityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn get(&self) -> Option<CachedIdentity> {
        self.slot.read().ok().and_then(|g| g.clone())
    }

    fn save(&self, identity: &CachedIdentity) {
        if let Ok(mut guard) = self.slot.write() {
            *guard = Some(identity.clone());
        }
    }
}

/// Receiver for requests replayed out of the observer's bootstrap buffer.
///
/// The identity-resolution collaborator implements this to harvest identity
/// material (e.g. a login response) from traffic that happened before it
/// was attached.
pub trait IdentitySink: Send + Sync {
    /// Inspects one observed request/response pair.
    fn observe_request(&self, record: &NetworkRequest);
}

/// Resolves the identity field without ever waiting on the network.
///
/// Wraps the host's [`IdentityStore`] and caches one generated anonymous
/// id per resolver so repeat triggers on the same page reuse it.
pub struct IdentityResolver {
    store: Arc<dyn IdentityStore>,
    anonymous: OnceLock<String>,
}

impl IdentityResolver {
    /// Creates a resolver over a store.
    #[must_use]
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self {
            store,
            anonymous: OnceLock::new(),
        }
    }

    /// The cached identity, or the anonymous fallback.
    ///
    /// The fallback is generated once, persisted through the store, and
    /// reported under [`ANONYMOUS_ID_FIELD`].
    #[must_use]
    pub fn resolve(&self) -> CachedIdentity {
        if let Some(identity) = self.store.get() {
            return identity;
        }

        let id = self.anonymous_id();
        let identity = CachedIdentity::new(ANONYMOUS_ID_FIELD, id);
        self.store.save(&identity);
        identity
    }

    /// The per-resolver anonymous identifier.
    #[must_use]
    pub fn anonymous_id(&self) -> String {
        self.anonymous
            .get_or_init(|| Uuid::new_v4().to_string())
            .clone()
    }
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("anonymous", &self.anonymous.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prefers_cached_identity() {
        let store = Arc::new(MemoryIdentityStore::new());
        store.save(&CachedIdentity::new("username", "ada"));

        let resolver = IdentityResolver::new(store);
        let identity = resolver.resolve();
        assert_eq!(identity.field, "username");
        assert_eq!(identity.value, "ada");
    }

    #[test]
    fn test_resolve_falls_back_to_anonymous() {
        let store = Arc::new(MemoryIdentityStore::new());
        let resolver = IdentityResolver::new(Arc::clone(&store) as Arc<dyn IdentityStore>);

        let identity = resolver.resolve();
        assert_eq!(identity.field, ANONYMOUS_ID_FIELD);
        assert!(!identity.value.is_empty());

        // Fallback is persisted and stable across resolutions.
        assert_eq!(store.get(), Some(identity.clone()));
        assert_eq!(resolver.resolve(), identity);
    }

    #[test]
    fn test_anonymous_id_is_stable_per_resolver() {
        let resolver = IdentityResolver::new(Arc::new(MemoryIdentityStore::new()));
        assert_eq!(resolver.anonymous_id(), resolver.anonymous_id());
    }
}
