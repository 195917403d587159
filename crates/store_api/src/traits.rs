//! Collaborator interfaces the core consumes.
//!
//! The session layer is written entirely against these traits; production
//! wiring supplies network-backed implementations, tests use the in-memory
//! ones from [`crate::testing`].

use std::{
    collections::HashMap,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::{
    key::Key,
    options::{
        IdRequest,
        Query,
        RpcOptions,
        TxHandle,
        TxOptions,
    },
};

/// Translates between caller-owned entities and their encoded bodies. The
/// core never looks inside an entity.
pub trait Codec: Send + Sync + 'static {
    type Entity: Clone + Send + Sync + 'static;

    fn encode(&self, entity: &Self::Entity) -> anyhow::Result<Bytes>;
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Self::Entity>;
    fn key_of(&self, entity: &Self::Entity) -> Key;
    /// The same entity re-keyed; used when the store assigns an id at write
    /// time.
    fn with_key(&self, entity: &Self::Entity, key: Key) -> Self::Entity;
}

/// The async transport to the entity store. All operations are multi-key;
/// batching above this layer is what turns point calls into these.
#[async_trait]
pub trait Stub: Send + Sync + 'static {
    /// Fetch encoded bodies; absent keys are simply missing from the map.
    async fn get_multi(
        &self,
        tx: Option<TxHandle>,
        keys: Vec<Key>,
        options: RpcOptions,
    ) -> anyhow::Result<HashMap<Key, Bytes>>;

    /// Write encoded bodies, returning final keys in argument order (ids
    /// assigned for incomplete keys).
    async fn put_multi(
        &self,
        tx: Option<TxHandle>,
        entities: Vec<(Key, Bytes)>,
        options: RpcOptions,
    ) -> anyhow::Result<Vec<Key>>;

    async fn delete_multi(
        &self,
        tx: Option<TxHandle>,
        keys: Vec<Key>,
        options: RpcOptions,
    ) -> anyhow::Result<()>;

    /// Reserve id ranges, one inclusive `(lo, hi)` pair per request, in
    /// argument order.
    async fn allocate_ids_multi(
        &self,
        requests: Vec<(Key, IdRequest)>,
        options: RpcOptions,
    ) -> anyhow::Result<Vec<(i64, i64)>>;

    async fn begin_tx(&self, options: TxOptions) -> anyhow::Result<TxHandle>;
    async fn commit(&self, tx: TxHandle) -> anyhow::Result<()>;
    async fn rollback(&self, tx: TxHandle) -> anyhow::Result<()>;
}

/// Compiled-query runner; yields `(key, encoded body)` pairs in key order.
pub trait QueryEngine: Send + Sync + 'static {
    fn run(&self, query: Query, options: RpcOptions)
        -> BoxStream<'static, anyhow::Result<(Key, Bytes)>>;
}

/// A value fetched from the shared cache. The compare-and-set id is present
/// only when the read requested it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheValue {
    pub bytes: Bytes,
    pub cas_id: Option<u64>,
}

/// Storage policy for shared-cache writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SetPolicy {
    /// Store unconditionally.
    Set,
    /// Store only if the key is absent.
    Add,
    /// Store only if the key is present.
    Replace,
    /// Store only if the key's compare-and-set id still matches.
    Cas,
}

/// One shared-cache write; `cas_id` is required for [`SetPolicy::Cas`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SetItem {
    pub value: Bytes,
    pub cas_id: Option<u64>,
}

/// Per-key outcome of a shared-cache delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Missing,
    Failed,
}

/// The async transport to the shared cache.
#[async_trait]
pub trait CacheTransport: Send + Sync + 'static {
    async fn get_multi(
        &self,
        keys: Vec<String>,
        for_cas: bool,
        namespace: String,
        deadline: Option<Duration>,
    ) -> anyhow::Result<HashMap<String, CacheValue>>;

    /// Returns whether the server stored each key.
    async fn set_multi(
        &self,
        policy: SetPolicy,
        entries: Vec<(String, SetItem)>,
        ttl: Option<Duration>,
        namespace: String,
        deadline: Option<Duration>,
    ) -> anyhow::Result<HashMap<String, bool>>;

    async fn delete_multi(
        &self,
        keys: Vec<String>,
        grace: Option<Duration>,
        namespace: String,
        deadline: Option<Duration>,
    ) -> anyhow::Result<HashMap<String, DeleteOutcome>>;

    /// Apply signed deltas to counters; `None` per key when the counter is
    /// absent and no initial value was supplied.
    async fn offset_multi(
        &self,
        deltas: Vec<(String, i64)>,
        initial: Option<u64>,
        namespace: String,
        deadline: Option<Duration>,
    ) -> anyhow::Result<HashMap<String, Option<u64>>>;
}

/// Supplies the ambient namespace when a caller does not pass one.
pub trait NamespaceResolver: Send + Sync + 'static {
    fn current(&self) -> String;
}

/// Resolver for single-tenant setups: everything in the empty namespace.
pub struct DefaultNamespace;

impl NamespaceResolver for DefaultNamespace {
    fn current(&self) -> String {
        String::new()
    }
}
