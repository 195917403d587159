//! Batched client for the external shared cache.
//!
//! Point operations coalesce into multi-key RPCs through four batchers, one
//! per operation family, keyed on the option tuple: calls batch together
//! only when their resolved namespace, TTL/CAS/grace settings, and deadline
//! all match. Every key is namespaced under a fixed prefix so the payload
//! format can be bumped by changing the prefix.

use std::{
    collections::HashSet,
    sync::Arc,
    time::Duration,
};

use batcher::{
    AutoBatcher,
    TodoList,
};
use bytes::Bytes;
use errors::ClientError;
use store_api::{
    CacheTransport,
    CacheValue,
    DeleteOutcome,
    NamespaceResolver,
    SetItem,
    SetPolicy,
};
use tasklets::{
    join,
    EventLoop,
    Promise,
};

/// Bump to invalidate every key written under the old format.
pub const DEFAULT_CACHE_PREFIX: &str = "ES1:";

/// Default per-batch item cap, matching the transport's multi-call limit.
pub const DEFAULT_BATCH_LIMIT: usize = 100;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct GetBatchOptions {
    for_cas: bool,
    namespace: String,
    deadline: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SetBatchOptions {
    policy: SetPolicy,
    ttl: Option<Duration>,
    namespace: String,
    deadline: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct DeleteBatchOptions {
    grace: Option<Duration>,
    namespace: String,
    deadline: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct OffsetBatchOptions {
    initial: Option<u64>,
    namespace: String,
    deadline: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub struct CacheGetOptions {
    /// Request a compare-and-set id with the value.
    pub for_cas: bool,
    /// Defaults to the ambient namespace at call time.
    pub namespace: Option<String>,
    /// Share one in-flight fetch among concurrent callers of the same key.
    pub use_local: bool,
    pub deadline: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub struct CacheSetOptions {
    pub ttl: Option<Duration>,
    pub namespace: Option<String>,
    /// Dedup identical concurrent writes.
    pub use_local: bool,
    pub deadline: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub struct CacheDeleteOptions {
    /// Ask the server to block re-adds for this long after the delete.
    pub grace: Option<Duration>,
    pub namespace: Option<String>,
    pub deadline: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub struct CacheOffsetOptions {
    /// Starting value for counters that do not exist yet.
    pub initial: Option<u64>,
    pub namespace: Option<String>,
    pub deadline: Option<Duration>,
}

struct Inner {
    ev: EventLoop,
    namespaces: Arc<dyn NamespaceResolver>,
    prefix: String,
    get_batcher: AutoBatcher<String, Option<CacheValue>, GetBatchOptions>,
    set_batcher: AutoBatcher<(String, SetItem), bool, SetBatchOptions>,
    delete_batcher: AutoBatcher<String, DeleteOutcome, DeleteBatchOptions>,
    offset_batcher: AutoBatcher<(String, i64), Option<u64>, OffsetBatchOptions>,
}

#[derive(Clone)]
pub struct RemoteCache {
    inner: Arc<Inner>,
}

impl RemoteCache {
    pub fn new(
        ev: &EventLoop,
        transport: Arc<dyn CacheTransport>,
        namespaces: Arc<dyn NamespaceResolver>,
        prefix: impl Into<String>,
        batch_limit: usize,
    ) -> Self {
        let get_batcher = AutoBatcher::new(
            ev,
            "remote_cache.get",
            batch_limit,
            Self::get_tasklet(ev, &transport),
        );
        let set_batcher = AutoBatcher::new(
            ev,
            "remote_cache.set",
            batch_limit,
            Self::set_tasklet(ev, &transport),
        );
        let delete_batcher = AutoBatcher::new(
            ev,
            "remote_cache.delete",
            batch_limit,
            Self::delete_tasklet(ev, &transport),
        );
        let offset_batcher = AutoBatcher::new(
            ev,
            "remote_cache.offset",
            batch_limit,
            Self::offset_tasklet(ev, &transport),
        );
        Self {
            inner: Arc::new(Inner {
                ev: ev.clone(),
                namespaces,
                prefix: prefix.into(),
                get_batcher,
                set_batcher,
                delete_batcher,
                offset_batcher,
            }),
        }
    }

    fn get_tasklet(
        ev: &EventLoop,
        transport: &Arc<dyn CacheTransport>,
    ) -> batcher::TodoTasklet<String, Option<CacheValue>, GetBatchOptions> {
        let ev = ev.clone();
        let transport = transport.clone();
        Arc::new(move |todo: TodoList<String, Option<CacheValue>>, options| {
            let transport = transport.clone();
            let ev2 = ev.clone();
            ev.spawn("remote_cache.get_batch", async move {
                let mut seen = HashSet::new();
                let mut keys = Vec::new();
                for (_, key) in &todo {
                    if seen.insert(key.clone()) {
                        keys.push(key.clone());
                    }
                }
                let rpc = {
                    let transport = transport.clone();
                    let keys = keys.clone();
                    let options = options.clone();
                    ev2.queue_rpc("rpc.cache_get", async move {
                        transport
                            .get_multi(keys, options.for_cas, options.namespace, options.deadline)
                            .await
                    })
                };
                let results = rpc.await?;
                for (fut, key) in todo {
                    fut.set_result(results.get(&key).cloned());
                }
                Ok(())
            })
        })
    }

    fn set_tasklet(
        ev: &EventLoop,
        transport: &Arc<dyn CacheTransport>,
    ) -> batcher::TodoTasklet<(String, SetItem), bool, SetBatchOptions> {
        let ev = ev.clone();
        let transport = transport.clone();
        Arc::new(move |todo: TodoList<(String, SetItem), bool>, options| {
            let transport = transport.clone();
            let ev2 = ev.clone();
            ev.spawn("remote_cache.set_batch", async move {
                // Last writer wins within a batch; the call surface forbids
                // two intentional sets of one key with identical options.
                let mut entries: Vec<(String, SetItem)> = Vec::new();
                for (_, (key, item)) in &todo {
                    match entries.iter().position(|(existing, _)| existing == key) {
                        Some(i) => entries[i].1 = item.clone(),
                        None => entries.push((key.clone(), item.clone())),
                    }
                }
                let rpc = {
                    let transport = transport.clone();
                    let options = options.clone();
                    ev2.queue_rpc("rpc.cache_set", async move {
                        transport
                            .set_multi(
                                options.policy,
                                entries,
                                options.ttl,
                                options.namespace,
                                options.deadline,
                            )
                            .await
                    })
                };
                let results = rpc.await?;
                for (fut, (key, _)) in todo {
                    fut.set_result(results.get(&key).copied().unwrap_or(false));
                }
                Ok(())
            })
        })
    }

    fn delete_tasklet(
        ev: &EventLoop,
        transport: &Arc<dyn CacheTransport>,
    ) -> batcher::TodoTasklet<String, DeleteOutcome, DeleteBatchOptions> {
        let ev = ev.clone();
        let transport = transport.clone();
        Arc::new(move |todo: TodoList<String, DeleteOutcome>, options| {
            let transport = transport.clone();
            let ev2 = ev.clone();
            ev.spawn("remote_cache.delete_batch", async move {
                let mut seen = HashSet::new();
                let mut keys = Vec::new();
                for (_, key) in &todo {
                    if seen.insert(key.clone()) {
                        keys.push(key.clone());
                    }
                }
                let rpc = {
                    let transport = transport.clone();
                    let keys = keys.clone();
                    let options = options.clone();
                    ev2.queue_rpc("rpc.cache_delete", async move {
                        transport
                            .delete_multi(keys, options.grace, options.namespace, options.deadline)
                            .await
                    })
                };
                let results = rpc.await?;
                for (fut, key) in todo {
                    fut.set_result(
                        results
                            .get(&key)
                            .copied()
                            .unwrap_or(DeleteOutcome::Failed),
                    );
                }
                Ok(())
            })
        })
    }

    fn offset_tasklet(
        ev: &EventLoop,
        transport: &Arc<dyn CacheTransport>,
    ) -> batcher::TodoTasklet<(String, i64), Option<u64>, OffsetBatchOptions> {
        let ev = ev.clone();
        let transport = transport.clone();
        Arc::new(move |todo: TodoList<(String, i64), Option<u64>>, options| {
            let transport = transport.clone();
            let ev2 = ev.clone();
            ev.spawn("remote_cache.offset_batch", async move {
                let mut deltas: Vec<(String, i64)> = Vec::new();
                for (_, (key, delta)) in &todo {
                    match deltas.iter().position(|(existing, _)| existing == key) {
                        Some(i) => deltas[i].1 = *delta,
                        None => deltas.push((key.clone(), *delta)),
                    }
                }
                let rpc = {
                    let transport = transport.clone();
                    let options = options.clone();
                    ev2.queue_rpc("rpc.cache_offset", async move {
                        transport
                            .offset_multi(
                                deltas,
                                options.initial,
                                options.namespace,
                                options.deadline,
                            )
                            .await
                    })
                };
                let results = rpc.await?;
                for (fut, (key, _)) in todo {
                    fut.set_result(results.get(&key).copied().flatten());
                }
                Ok(())
            })
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{key}", self.inner.prefix)
    }

    fn resolve_namespace(&self, namespace: Option<String>) -> String {
        namespace.unwrap_or_else(|| self.inner.namespaces.current())
    }

    fn validate_key(&self, key: &str) -> anyhow::Result<()> {
        if key.is_empty() {
            return Err(ClientError::validation("cache key must be non-empty"));
        }
        Ok(())
    }

    /// Fetch one value; `None` when absent.
    pub fn get(&self, key: &str, options: CacheGetOptions) -> Promise<Option<CacheValue>> {
        if let Err(err) = self.validate_key(key) {
            return Promise::rejected(&self.inner.ev, err);
        }
        let batch_options = GetBatchOptions {
            for_cas: options.for_cas,
            namespace: self.resolve_namespace(options.namespace),
            deadline: options.deadline,
        };
        let key = self.prefixed(key);
        if options.use_local {
            self.inner.get_batcher.add_once(key, batch_options)
        } else {
            self.inner.get_batcher.add(key, batch_options)
        }
    }

    /// Fetch one value along with its compare-and-set id.
    pub fn gets(&self, key: &str, mut options: CacheGetOptions) -> Promise<Option<CacheValue>> {
        options.for_cas = true;
        self.get(key, options)
    }

    fn set_with_policy(
        &self,
        policy: SetPolicy,
        key: &str,
        item: SetItem,
        options: CacheSetOptions,
    ) -> Promise<bool> {
        if let Err(err) = self.validate_key(key) {
            return Promise::rejected(&self.inner.ev, err);
        }
        let batch_options = SetBatchOptions {
            policy,
            ttl: options.ttl,
            namespace: self.resolve_namespace(options.namespace),
            deadline: options.deadline,
        };
        let arg = (self.prefixed(key), item);
        if options.use_local {
            self.inner.set_batcher.add_once(arg, batch_options)
        } else {
            self.inner.set_batcher.add(arg, batch_options)
        }
    }

    /// Store unconditionally. Resolves with whether the server stored it.
    pub fn set(&self, key: &str, value: Bytes, options: CacheSetOptions) -> Promise<bool> {
        self.set_with_policy(
            SetPolicy::Set,
            key,
            SetItem {
                value,
                cas_id: None,
            },
            options,
        )
    }

    /// Store only if absent.
    pub fn add(&self, key: &str, value: Bytes, options: CacheSetOptions) -> Promise<bool> {
        self.set_with_policy(
            SetPolicy::Add,
            key,
            SetItem {
                value,
                cas_id: None,
            },
            options,
        )
    }

    /// Store only if present.
    pub fn replace(&self, key: &str, value: Bytes, options: CacheSetOptions) -> Promise<bool> {
        self.set_with_policy(
            SetPolicy::Replace,
            key,
            SetItem {
                value,
                cas_id: None,
            },
            options,
        )
    }

    /// Store only if the compare-and-set id from a prior [`RemoteCache::gets`]
    /// still matches.
    pub fn compare_and_swap(
        &self,
        key: &str,
        value: Bytes,
        cas_id: u64,
        options: CacheSetOptions,
    ) -> Promise<bool> {
        self.set_with_policy(
            SetPolicy::Cas,
            key,
            SetItem {
                value,
                cas_id: Some(cas_id),
            },
            options,
        )
    }

    /// Delete one key, resolving with the per-key status.
    pub fn delete(&self, key: &str, options: CacheDeleteOptions) -> Promise<DeleteOutcome> {
        if let Err(err) = self.validate_key(key) {
            return Promise::rejected(&self.inner.ev, err);
        }
        let batch_options = DeleteBatchOptions {
            grace: options.grace,
            namespace: self.resolve_namespace(options.namespace),
            deadline: options.deadline,
        };
        self.inner.delete_batcher.add(self.prefixed(key), batch_options)
    }

    /// Increment a counter, resolving with the new value (`None` when the
    /// counter is absent and no initial value was configured).
    pub fn incr(&self, key: &str, delta: u64, options: CacheOffsetOptions) -> Promise<Option<u64>> {
        self.offset(key, delta, false, options)
    }

    /// Decrement a counter; the server clamps at zero.
    pub fn decr(&self, key: &str, delta: u64, options: CacheOffsetOptions) -> Promise<Option<u64>> {
        self.offset(key, delta, true, options)
    }

    fn offset(
        &self,
        key: &str,
        delta: u64,
        negate: bool,
        options: CacheOffsetOptions,
    ) -> Promise<Option<u64>> {
        if let Err(err) = self.validate_key(key) {
            return Promise::rejected(&self.inner.ev, err);
        }
        let Ok(delta) = i64::try_from(delta) else {
            return Promise::rejected(
                &self.inner.ev,
                ClientError::validation("counter delta out of range"),
            );
        };
        let delta = if negate { -delta } else { delta };
        let batch_options = OffsetBatchOptions {
            initial: options.initial,
            namespace: self.resolve_namespace(options.namespace),
            deadline: options.deadline,
        };
        self.inner
            .offset_batcher
            .add((self.prefixed(key), delta), batch_options)
    }

    /// Drain all four batchers.
    pub fn flush(&self) -> Promise<()> {
        let flushes = vec![
            self.inner.get_batcher.flush(),
            self.inner.set_batcher.flush(),
            self.inner.delete_batcher.flush(),
            self.inner.offset_batcher.flush(),
        ];
        let ev = self.inner.ev.clone();
        let joined = join(&ev, &flushes);
        ev.spawn("remote_cache.flush", async move {
            joined.await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use store_api::{
        testing::TestStore,
        DefaultNamespace,
        DeleteOutcome,
        NamespaceResolver,
    };
    use tasklets::{
        wait_all,
        EventLoop,
    };

    use super::{
        CacheDeleteOptions,
        CacheGetOptions,
        CacheOffsetOptions,
        CacheSetOptions,
        RemoteCache,
        DEFAULT_CACHE_PREFIX,
    };

    fn cache_with(store: &Arc<TestStore>, ev: &EventLoop) -> RemoteCache {
        RemoteCache::new(
            ev,
            store.clone(),
            Arc::new(DefaultNamespace),
            DEFAULT_CACHE_PREFIX,
            100,
        )
    }

    #[test]
    fn test_set_then_get_round_trips_with_prefix() {
        let ev = EventLoop::new();
        let store = TestStore::new();
        let cache = cache_with(&store, &ev);
        assert!(cache
            .set("alpha", Bytes::from_static(b"one"), CacheSetOptions::default())
            .get_result()
            .unwrap());
        // The stored key carries the namespace prefix.
        assert_eq!(
            store.cache_value("", "ES1:alpha"),
            Some(Bytes::from_static(b"one"))
        );
        let value = cache
            .get("alpha", CacheGetOptions::default())
            .get_result()
            .unwrap()
            .unwrap();
        assert_eq!(value.bytes, Bytes::from_static(b"one"));
        assert_eq!(value.cas_id, None);
    }

    #[test]
    fn test_gets_carries_cas_id_and_cas_enforces_it() {
        let ev = EventLoop::new();
        let store = TestStore::new();
        let cache = cache_with(&store, &ev);
        cache
            .set("counter", Bytes::from_static(b"a"), CacheSetOptions::default())
            .get_result()
            .unwrap();
        let value = cache
            .gets("counter", CacheGetOptions::default())
            .get_result()
            .unwrap()
            .unwrap();
        let cas_id = value.cas_id.unwrap();
        assert!(cache
            .compare_and_swap(
                "counter",
                Bytes::from_static(b"b"),
                cas_id,
                CacheSetOptions::default(),
            )
            .get_result()
            .unwrap());
        // The stored cas id moved on; the stale id no longer wins.
        assert!(!cache
            .compare_and_swap(
                "counter",
                Bytes::from_static(b"c"),
                cas_id,
                CacheSetOptions::default(),
            )
            .get_result()
            .unwrap());
    }

    #[test]
    fn test_add_and_replace_policies() {
        let ev = EventLoop::new();
        let store = TestStore::new();
        let cache = cache_with(&store, &ev);
        assert!(!cache
            .replace("missing", Bytes::from_static(b"x"), CacheSetOptions::default())
            .get_result()
            .unwrap());
        assert!(cache
            .add("missing", Bytes::from_static(b"x"), CacheSetOptions::default())
            .get_result()
            .unwrap());
        assert!(!cache
            .add("missing", Bytes::from_static(b"y"), CacheSetOptions::default())
            .get_result()
            .unwrap());
        assert!(cache
            .replace("missing", Bytes::from_static(b"z"), CacheSetOptions::default())
            .get_result()
            .unwrap());
    }

    #[test]
    fn test_gets_with_same_options_coalesce() {
        let ev = EventLoop::new();
        let store = TestStore::new();
        let cache = cache_with(&store, &ev);
        let futures = vec![
            cache.get("a", CacheGetOptions::default()),
            cache.get("b", CacheGetOptions::default()),
            cache.get("a", CacheGetOptions::default()),
        ];
        wait_all(&futures);
        // One RPC, duplicate keys deduplicated on the wire.
        assert_eq!(store.count("cache_get"), 1);
        assert_eq!(store.calls()[0].keys, 2);
    }

    #[test]
    fn test_distinct_namespaces_do_not_coalesce() {
        let ev = EventLoop::new();
        let store = TestStore::new();
        let cache = cache_with(&store, &ev);
        let futures = vec![
            cache.get(
                "a",
                CacheGetOptions {
                    namespace: Some("tenant-1".to_string()),
                    ..Default::default()
                },
            ),
            cache.get(
                "a",
                CacheGetOptions {
                    namespace: Some("tenant-2".to_string()),
                    ..Default::default()
                },
            ),
        ];
        wait_all(&futures);
        assert_eq!(store.count("cache_get"), 2);
    }

    #[test]
    fn test_use_local_shares_one_promise() {
        let ev = EventLoop::new();
        let store = TestStore::new();
        let cache = cache_with(&store, &ev);
        let options = CacheGetOptions {
            use_local: true,
            ..Default::default()
        };
        let first = cache.get("shared", options.clone());
        let second = cache.get("shared", options);
        assert!(first.same(&second));
        wait_all(&[first, second]);
        assert_eq!(store.count("cache_get"), 1);
    }

    #[test]
    fn test_delete_statuses() {
        let ev = EventLoop::new();
        let store = TestStore::new();
        let cache = cache_with(&store, &ev);
        cache
            .set("gone", Bytes::from_static(b"v"), CacheSetOptions::default())
            .get_result()
            .unwrap();
        assert_eq!(
            cache
                .delete("gone", CacheDeleteOptions::default())
                .get_result()
                .unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            cache
                .delete("gone", CacheDeleteOptions::default())
                .get_result()
                .unwrap(),
            DeleteOutcome::Missing
        );
    }

    #[test]
    fn test_incr_decr_with_initial_and_clamp() {
        let ev = EventLoop::new();
        let store = TestStore::new();
        let cache = cache_with(&store, &ev);
        assert_eq!(
            cache
                .incr("hits", 1, CacheOffsetOptions::default())
                .get_result()
                .unwrap(),
            None
        );
        let with_initial = CacheOffsetOptions {
            initial: Some(10),
            ..Default::default()
        };
        assert_eq!(
            cache
                .incr("hits", 5, with_initial)
                .get_result()
                .unwrap(),
            Some(15)
        );
        assert_eq!(
            cache
                .decr("hits", 100, CacheOffsetOptions::default())
                .get_result()
                .unwrap(),
            Some(0)
        );
    }

    #[test]
    fn test_transport_failure_fans_out() {
        let ev = EventLoop::new();
        let store = TestStore::new();
        let cache = cache_with(&store, &ev);
        store.fail_next("cache_get", 1);
        let futures = vec![
            cache.get("a", CacheGetOptions::default()),
            cache.get("b", CacheGetOptions::default()),
        ];
        wait_all(&futures);
        for fut in &futures {
            let err = fut.get_result().unwrap_err();
            assert!(format!("{err:#}").contains("injected cache_get failure"));
        }
    }

    #[test]
    fn test_empty_key_rejected() {
        let ev = EventLoop::new();
        let store = TestStore::new();
        let cache = cache_with(&store, &ev);
        let err = cache
            .get("", CacheGetOptions::default())
            .get_result()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<errors::ClientError>(),
            Some(errors::ClientError::Validation(_))
        ));
        assert_eq!(store.count("cache_get"), 0);
    }

    #[test]
    fn test_ambient_namespace_resolved_at_call_time() {
        struct Tenant;
        impl NamespaceResolver for Tenant {
            fn current(&self) -> String {
                "tenant-9".to_string()
            }
        }
        let ev = EventLoop::new();
        let store = TestStore::new();
        let cache = RemoteCache::new(&ev, store.clone(), Arc::new(Tenant), "ES1:", 100);
        cache
            .set("scoped", Bytes::from_static(b"v"), CacheSetOptions::default())
            .get_result()
            .unwrap();
        assert_eq!(
            store.cache_value("tenant-9", "ES1:scoped"),
            Some(Bytes::from_static(b"v"))
        );
    }

    #[test]
    fn test_flush_drains_pending_operations() {
        let ev = EventLoop::new();
        let store = TestStore::new();
        let cache = cache_with(&store, &ev);
        let set = cache.set("k", Bytes::from_static(b"v"), CacheSetOptions::default());
        let get = cache.get("k", CacheGetOptions::default());
        cache.flush().get_result().unwrap();
        assert!(set.done());
        assert!(get.done());
    }
}
