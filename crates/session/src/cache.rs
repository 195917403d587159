//! The per-context session cache.

use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::Arc,
    time::Duration,
};

use store_api::Key;
use tasklets::Promise;

/// One cache slot. A pending slot holds the promise of an in-flight point
/// read so concurrent readers coalesce onto it; a tombstone remembers a
/// miss or a delete so repeated lookups stay local.
pub(crate) enum CacheEntry<E> {
    Entity(E),
    Tombstone,
    Pending(Promise<Option<E>>),
}

impl<E: Clone> Clone for CacheEntry<E> {
    fn clone(&self) -> Self {
        match self {
            CacheEntry::Entity(entity) => CacheEntry::Entity(entity.clone()),
            CacheEntry::Tombstone => CacheEntry::Tombstone,
            CacheEntry::Pending(fut) => CacheEntry::Pending(fut.clone()),
        }
    }
}

/// Key-indexed slots plus the set of keys written through this context.
/// The write set is what a committed transaction merges into its parent
/// and what drives remote-cache invalidation on commit.
pub(crate) struct SessionCache<E> {
    pub entries: HashMap<Key, CacheEntry<E>>,
    pub writes: HashSet<Key>,
}

impl<E> SessionCache<E> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            writes: HashSet::new(),
        }
    }
}

/// Per-key predicate deciding whether a key participates in a cache layer.
pub type KeyPredicate = Arc<dyn Fn(&Key) -> bool + Send + Sync>;

/// Per-key TTL override for read-through shared-cache writes.
pub type TtlPolicy = Arc<dyn Fn(&Key) -> Option<Duration> + Send + Sync>;

#[derive(Clone)]
pub struct CachePolicies {
    pub cache: KeyPredicate,
    pub remote_cache: KeyPredicate,
    pub remote_cache_ttl: TtlPolicy,
}

impl Default for CachePolicies {
    fn default() -> Self {
        Self {
            cache: Arc::new(|_| true),
            remote_cache: Arc::new(|_| true),
            remote_cache_ttl: Arc::new(|_| None),
        }
    }
}
