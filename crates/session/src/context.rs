//! The session context: a caching, batching front over the remote store.
//!
//! A context owns a connection (plain, or bound to an open transaction), a
//! session cache, one batcher per point operation, and an optional
//! shared-cache handle. Point operations return promises immediately; the
//! actual RPCs form when the event loop goes idle or a batch fills.
//!
//! Cache coherence rules, in force throughout:
//! - at most one slot per key, and a pending slot dominates: concurrent
//!   reads share the in-flight promise;
//! - writers replace any slot unconditionally; a completed read writes its
//!   result back only if its own promise still owns the slot;
//! - the shared cache is delete-only on writes and write-through on read
//!   misses, so overlapping writers can never publish a stale value.

use std::sync::Arc;

use batcher::{
    AutoBatcher,
    TodoList,
};
use bytes::Bytes;
use parking_lot::Mutex;
use store_api::{
    CacheTransport,
    Codec,
    IdRequest,
    Key,
    NamespaceResolver,
    QueryEngine,
    RpcOptions,
    Stub,
    TxHandle,
};
use remote_cache::{
    CacheDeleteOptions,
    CacheGetOptions,
    CacheSetOptions,
    RemoteCache,
};
use tasklets::{
    join,
    EventLoop,
    Promise,
};

use crate::{
    cache::{
        CacheEntry,
        CachePolicies,
        KeyPredicate,
        SessionCache,
        TtlPolicy,
    },
    config::Config,
};

/// Per-call read options. `None` fields defer to the context's policies.
#[derive(Clone, Debug, Default)]
pub struct GetOptions {
    pub use_cache: Option<bool>,
    pub use_remote_cache: Option<bool>,
    pub rpc: RpcOptions,
}

/// Per-call write options.
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    pub use_cache: Option<bool>,
    pub use_remote_cache: Option<bool>,
    pub rpc: RpcOptions,
}

pub(crate) struct ContextInner<C: Codec> {
    pub ev: EventLoop,
    pub codec: Arc<C>,
    pub stub: Arc<dyn Stub>,
    pub query_engine: Arc<dyn QueryEngine>,
    /// Set iff this context is a transactional child.
    pub tx: Option<TxHandle>,
    pub parent: Option<Context<C>>,
    pub config: Config,
    pub policies: CachePolicies,
    pub cache: Mutex<SessionCache<C::Entity>>,
    pub remote_cache: Option<RemoteCache>,
    pub get_batcher: AutoBatcher<Key, Option<Bytes>, RpcOptions>,
    pub put_batcher: AutoBatcher<(Key, Bytes), Key, RpcOptions>,
    pub delete_batcher: AutoBatcher<Key, (), RpcOptions>,
    pub allocate_batcher: AutoBatcher<(Key, IdRequest), (i64, i64), RpcOptions>,
}

pub struct Context<C: Codec> {
    pub(crate) inner: Arc<ContextInner<C>>,
}

impl<C: Codec> Clone for Context<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub struct ContextBuilder<C: Codec> {
    ev: EventLoop,
    codec: Arc<C>,
    stub: Arc<dyn Stub>,
    query_engine: Arc<dyn QueryEngine>,
    cache_transport: Option<Arc<dyn CacheTransport>>,
    namespaces: Arc<dyn NamespaceResolver>,
    config: Config,
    policies: CachePolicies,
}

impl<C: Codec> ContextBuilder<C> {
    pub fn new(
        ev: &EventLoop,
        codec: Arc<C>,
        stub: Arc<dyn Stub>,
        query_engine: Arc<dyn QueryEngine>,
    ) -> Self {
        Self {
            ev: ev.clone(),
            codec,
            stub,
            query_engine,
            cache_transport: None,
            namespaces: Arc::new(store_api::DefaultNamespace),
            config: Config::default(),
            policies: CachePolicies::default(),
        }
    }

    /// Attach the shared cache; without one, reads and writes go straight
    /// to the store.
    pub fn cache_transport(mut self, transport: Arc<dyn CacheTransport>) -> Self {
        self.cache_transport = Some(transport);
        self
    }

    pub fn namespaces(mut self, namespaces: Arc<dyn NamespaceResolver>) -> Self {
        self.namespaces = namespaces;
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn cache_policy(mut self, policy: KeyPredicate) -> Self {
        self.policies.cache = policy;
        self
    }

    pub fn remote_cache_policy(mut self, policy: KeyPredicate) -> Self {
        self.policies.remote_cache = policy;
        self
    }

    pub fn remote_cache_ttl_policy(mut self, policy: TtlPolicy) -> Self {
        self.policies.remote_cache_ttl = policy;
        self
    }

    pub fn build(self) -> Context<C> {
        let remote_cache = self.cache_transport.map(|transport| {
            RemoteCache::new(
                &self.ev,
                transport,
                self.namespaces.clone(),
                self.config.remote_cache_prefix.clone(),
                self.config.max_remote_cache_items,
            )
        });
        Context::from_parts(
            self.ev,
            self.codec,
            self.stub,
            self.query_engine,
            None,
            None,
            self.config,
            self.policies,
            remote_cache,
        )
    }
}

impl<C: Codec> Context<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        ev: EventLoop,
        codec: Arc<C>,
        stub: Arc<dyn Stub>,
        query_engine: Arc<dyn QueryEngine>,
        tx: Option<TxHandle>,
        parent: Option<Context<C>>,
        config: Config,
        policies: CachePolicies,
        remote_cache: Option<RemoteCache>,
    ) -> Self {
        let limit = config.auto_batch_limit;
        let get_batcher = build_get_batcher(&ev, &stub, tx, limit);
        let put_batcher = build_put_batcher(&ev, &stub, tx, limit);
        let delete_batcher = build_delete_batcher(&ev, &stub, tx, limit);
        let allocate_batcher = build_allocate_batcher(&ev, &stub, limit);
        Self {
            inner: Arc::new(ContextInner {
                ev,
                codec,
                stub,
                query_engine,
                tx,
                parent,
                config,
                policies,
                cache: Mutex::new(SessionCache::new()),
                remote_cache,
                get_batcher,
                put_batcher,
                delete_batcher,
                allocate_batcher,
            }),
        }
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.ev
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.tx.is_some()
    }

    /// The context this transactional child was forked from.
    pub fn parent(&self) -> Option<Context<C>> {
        self.inner.parent.clone()
    }

    pub fn codec(&self) -> &Arc<C> {
        &self.inner.codec
    }

    pub(crate) fn rpc_options(&self, rpc: &RpcOptions) -> RpcOptions {
        let mut options = rpc.clone();
        if options.deadline.is_none() {
            options.deadline = self.inner.config.default_deadline;
        }
        options
    }

    fn use_session_cache(&self, key: &Key, requested: Option<bool>) -> bool {
        requested.unwrap_or_else(|| (self.inner.policies.cache)(key))
    }

    /// The shared cache never participates inside a transaction: reads must
    /// observe the transaction's snapshot and writes become deletes at
    /// commit time.
    fn use_remote_cache(&self, key: &Key, requested: Option<bool>) -> bool {
        if self.inner.tx.is_some() || self.inner.remote_cache.is_none() {
            return false;
        }
        requested.unwrap_or_else(|| (self.inner.policies.remote_cache)(key))
    }

    fn remote_ttl(&self, key: &Key) -> Option<std::time::Duration> {
        (self.inner.policies.remote_cache_ttl)(key).or(self.inner.config.remote_cache_ttl)
    }

    pub fn get(&self, key: &Key) -> Promise<Option<C::Entity>> {
        self.get_with_options(key, GetOptions::default())
    }

    pub fn get_with_options(&self, key: &Key, options: GetOptions) -> Promise<Option<C::Entity>> {
        let use_cache = self.use_session_cache(key, options.use_cache);
        if use_cache {
            let hit = self.inner.cache.lock().entries.get(key).cloned();
            match hit {
                Some(CacheEntry::Entity(entity)) => {
                    return Promise::resolved(&self.inner.ev, Some(entity));
                },
                Some(CacheEntry::Tombstone) => {
                    return Promise::resolved(&self.inner.ev, None);
                },
                Some(CacheEntry::Pending(fut)) => return fut,
                None => {},
            }
        }
        let fut = Promise::new(&self.inner.ev, format!("context.get({key})"));
        if use_cache {
            self.inner
                .cache
                .lock()
                .entries
                .insert(key.clone(), CacheEntry::Pending(fut.clone()));
        }
        let this = self.clone();
        let key = key.clone();
        let result_fut = fut.clone();
        self.inner.ev.spawn("context.get", async move {
            let outcome = this.load_entity(&key, &options).await;
            if use_cache {
                let mut cache = this.inner.cache.lock();
                // Write back only while our own promise still owns the
                // slot; a concurrent writer replaced it otherwise and this
                // result is stale.
                let still_mine = matches!(
                    cache.entries.get(&key),
                    Some(CacheEntry::Pending(current)) if current.same(&result_fut)
                );
                if still_mine {
                    match &outcome {
                        Ok(Some(entity)) => {
                            cache
                                .entries
                                .insert(key.clone(), CacheEntry::Entity(entity.clone()));
                        },
                        Ok(None) => {
                            cache.entries.insert(key.clone(), CacheEntry::Tombstone);
                        },
                        Err(_) => {
                            cache.entries.remove(&key);
                        },
                    }
                }
            }
            match outcome {
                Ok(value) => {
                    result_fut.resolve_if_pending(value);
                },
                Err(err) => {
                    result_fut.fail_if_pending(Arc::new(err));
                },
            }
            Ok(())
        });
        fut
    }

    /// Shared-cache read-through, then the batched store fetch.
    async fn load_entity(
        &self,
        key: &Key,
        options: &GetOptions,
    ) -> anyhow::Result<Option<C::Entity>> {
        let use_remote = self.use_remote_cache(key, options.use_remote_cache);
        let token = key.cache_token();
        if use_remote {
            let remote = self.inner.remote_cache.as_ref().expect("checked above");
            let cached = remote
                .get(
                    &token,
                    CacheGetOptions {
                        deadline: options.rpc.deadline,
                        ..Default::default()
                    },
                )
                .await;
            match cached {
                Ok(Some(value)) => return Ok(Some(self.inner.codec.decode(&value.bytes)?)),
                Ok(None) => {},
                // A cache fetch failure downgrades to a store read.
                Err(err) => tracing::warn!("shared cache read failed for {key}: {err:#}"),
            }
        }
        let fetched = self
            .inner
            .get_batcher
            .add(key.clone(), self.rpc_options(&options.rpc))
            .await?;
        let Some(bytes) = fetched else {
            return Ok(None);
        };
        let entity = self.inner.codec.decode(&bytes)?;
        if use_remote {
            let remote = self.inner.remote_cache.as_ref().expect("checked above");
            let populate = remote.add(
                &token,
                bytes,
                CacheSetOptions {
                    ttl: self.remote_ttl(key),
                    ..Default::default()
                },
            );
            if let Err(err) = populate.await {
                tracing::debug!("shared cache populate failed for {key}: {err:#}");
            }
        }
        Ok(Some(entity))
    }

    pub fn put(&self, entity: &C::Entity) -> Promise<Key> {
        self.put_with_options(entity, WriteOptions::default())
    }

    pub fn put_with_options(&self, entity: &C::Entity, options: WriteOptions) -> Promise<Key> {
        let key = self.inner.codec.key_of(entity);
        let encoded = match self.inner.codec.encode(entity) {
            Ok(bytes) => bytes,
            Err(err) => return Promise::rejected(&self.inner.ev, err),
        };
        let use_cache = self.use_session_cache(&key, options.use_cache);
        if use_cache && key.is_complete() {
            // Optimistic: the entity is visible to session reads before the
            // write lands. This replaces any pending read slot.
            let mut cache = self.inner.cache.lock();
            cache
                .entries
                .insert(key.clone(), CacheEntry::Entity(entity.clone()));
            cache.writes.insert(key.clone());
        }
        let this = self.clone();
        let entity = entity.clone();
        let label = format!("context.put({key})");
        self.inner.ev.spawn(label, async move {
            let final_key = this
                .inner
                .put_batcher
                .add((key, encoded), this.rpc_options(&options.rpc))
                .await?;
            if use_cache {
                let stored = this.inner.codec.with_key(&entity, final_key.clone());
                let mut cache = this.inner.cache.lock();
                cache
                    .entries
                    .insert(final_key.clone(), CacheEntry::Entity(stored));
                cache.writes.insert(final_key.clone());
            }
            this.invalidate_remote(&final_key, options.use_remote_cache)
                .await;
            Ok(final_key)
        })
    }

    pub fn delete(&self, key: &Key) -> Promise<()> {
        self.delete_with_options(key, WriteOptions::default())
    }

    pub fn delete_with_options(&self, key: &Key, options: WriteOptions) -> Promise<()> {
        let use_cache = self.use_session_cache(key, options.use_cache);
        let this = self.clone();
        let key = key.clone();
        let label = format!("context.delete({key})");
        self.inner.ev.spawn(label, async move {
            this.inner
                .delete_batcher
                .add(key.clone(), this.rpc_options(&options.rpc))
                .await?;
            if use_cache {
                let mut cache = this.inner.cache.lock();
                cache.entries.insert(key.clone(), CacheEntry::Tombstone);
                cache.writes.insert(key.clone());
            }
            this.invalidate_remote(&key, options.use_remote_cache).await;
            Ok(())
        })
    }

    /// Reserve an inclusive `(lo, hi)` id range under `parent`.
    pub fn allocate_ids(&self, parent: &Key, request: IdRequest) -> Promise<(i64, i64)> {
        self.inner
            .allocate_batcher
            .add((parent.clone(), request), self.rpc_options(&RpcOptions::default()))
    }

    /// Writes never publish to the shared cache; they only delete, which
    /// closes the window where a slower writer could overwrite a newer
    /// value with an older one.
    pub(crate) async fn invalidate_remote(&self, key: &Key, requested: Option<bool>) {
        if !self.use_remote_cache(key, requested) {
            return;
        }
        let remote = self.inner.remote_cache.as_ref().expect("checked above");
        if let Err(err) = remote
            .delete(&key.cache_token(), CacheDeleteOptions::default())
            .await
        {
            tracing::warn!("shared cache invalidation failed for {key}: {err:#}");
        }
    }

    /// Drain every batcher owned by this context.
    pub fn flush(&self) -> Promise<()> {
        let mut flushes = vec![
            self.inner.get_batcher.flush(),
            self.inner.put_batcher.flush(),
            self.inner.delete_batcher.flush(),
            self.inner.allocate_batcher.flush(),
        ];
        if let Some(remote) = &self.inner.remote_cache {
            flushes.push(remote.flush());
        }
        let joined = join(&self.inner.ev, &flushes);
        self.inner.ev.spawn("context.flush", async move {
            joined.await?;
            Ok(())
        })
    }

    /// Test and diagnostic hook: the cached entity for `key`, if the slot
    /// holds a value.
    pub fn cached_entity(&self, key: &Key) -> Option<C::Entity> {
        match self.inner.cache.lock().entries.get(key) {
            Some(CacheEntry::Entity(entity)) => Some(entity.clone()),
            _ => None,
        }
    }

    /// Whether the session cache has any slot for `key`.
    pub fn is_cached(&self, key: &Key) -> bool {
        self.inner.cache.lock().entries.contains_key(key)
    }
}

fn build_get_batcher(
    ev: &EventLoop,
    stub: &Arc<dyn Stub>,
    tx: Option<TxHandle>,
    limit: usize,
) -> AutoBatcher<Key, Option<Bytes>, RpcOptions> {
    let todo_tasklet = {
        let ev = ev.clone();
        let stub = stub.clone();
        Arc::new(move |todo: TodoList<Key, Option<Bytes>>, options: RpcOptions| {
            let ev2 = ev.clone();
            let stub = stub.clone();
            ev.spawn("context.get_batch", async move {
                let keys: Vec<Key> = todo.iter().map(|(_, key)| key.clone()).collect();
                let rpc = {
                    let stub = stub.clone();
                    ev2.queue_rpc("rpc.get", async move {
                        stub.get_multi(tx, keys, options).await
                    })
                };
                let results = rpc.await?;
                for (fut, key) in todo {
                    fut.set_result(results.get(&key).cloned());
                }
                Ok(())
            })
        })
    };
    AutoBatcher::new(ev, "context.get", limit, todo_tasklet)
}

fn build_put_batcher(
    ev: &EventLoop,
    stub: &Arc<dyn Stub>,
    tx: Option<TxHandle>,
    limit: usize,
) -> AutoBatcher<(Key, Bytes), Key, RpcOptions> {
    let todo_tasklet = {
        let ev = ev.clone();
        let stub = stub.clone();
        Arc::new(move |todo: TodoList<(Key, Bytes), Key>, options: RpcOptions| {
            let ev2 = ev.clone();
            let stub = stub.clone();
            ev.spawn("context.put_batch", async move {
                let entities: Vec<(Key, Bytes)> =
                    todo.iter().map(|(_, arg)| arg.clone()).collect();
                let count = entities.len();
                let rpc = {
                    let stub = stub.clone();
                    ev2.queue_rpc("rpc.put", async move {
                        stub.put_multi(tx, entities, options).await
                    })
                };
                let finals = rpc.await?;
                anyhow::ensure!(
                    finals.len() == count,
                    "store returned {} keys for {count} writes",
                    finals.len(),
                );
                for ((fut, _), final_key) in todo.into_iter().zip(finals) {
                    fut.set_result(final_key);
                }
                Ok(())
            })
        })
    };
    AutoBatcher::new(ev, "context.put", limit, todo_tasklet)
}

fn build_delete_batcher(
    ev: &EventLoop,
    stub: &Arc<dyn Stub>,
    tx: Option<TxHandle>,
    limit: usize,
) -> AutoBatcher<Key, (), RpcOptions> {
    let todo_tasklet = {
        let ev = ev.clone();
        let stub = stub.clone();
        Arc::new(move |todo: TodoList<Key, ()>, options: RpcOptions| {
            let ev2 = ev.clone();
            let stub = stub.clone();
            ev.spawn("context.delete_batch", async move {
                let keys: Vec<Key> = todo.iter().map(|(_, key)| key.clone()).collect();
                let rpc = {
                    let stub = stub.clone();
                    ev2.queue_rpc("rpc.delete", async move {
                        stub.delete_multi(tx, keys, options).await
                    })
                };
                rpc.await?;
                for (fut, _) in todo {
                    fut.set_result(());
                }
                Ok(())
            })
        })
    };
    AutoBatcher::new(ev, "context.delete", limit, todo_tasklet)
}

fn build_allocate_batcher(
    ev: &EventLoop,
    stub: &Arc<dyn Stub>,
    limit: usize,
) -> AutoBatcher<(Key, IdRequest), (i64, i64), RpcOptions> {
    let todo_tasklet = {
        let ev = ev.clone();
        let stub = stub.clone();
        Arc::new(
            move |todo: TodoList<(Key, IdRequest), (i64, i64)>, options: RpcOptions| {
                let ev2 = ev.clone();
                let stub = stub.clone();
                ev.spawn("context.allocate_batch", async move {
                    let requests: Vec<(Key, IdRequest)> =
                        todo.iter().map(|(_, arg)| arg.clone()).collect();
                    let count = requests.len();
                    let rpc = {
                        let stub = stub.clone();
                        ev2.queue_rpc("rpc.allocate_ids", async move {
                            stub.allocate_ids_multi(requests, options).await
                        })
                    };
                    let ranges = rpc.await?;
                    anyhow::ensure!(
                        ranges.len() == count,
                        "store returned {} ranges for {count} requests",
                        ranges.len(),
                    );
                    for ((fut, _), range) in todo.into_iter().zip(ranges) {
                        fut.set_result(range);
                    }
                    Ok(())
                })
            },
        )
    };
    AutoBatcher::new(ev, "context.allocate_ids", limit, todo_tasklet)
}
