//! In-memory collaborators: a store stub, query engine, and shared-cache
//! transport backed by one mutex-guarded state, plus a JSON entity codec.
//!
//! Every call is recorded, so tests can assert batch formation ("three gets
//! coalesced into one RPC") rather than just final state. `fail_next`
//! injects failures per operation, which is how transaction-retry and
//! batch-error fan-out paths get exercised.

use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use errors::ClientError;
use futures::stream::{
    self,
    BoxStream,
};
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    key::Key,
    options::{
        IdRequest,
        Query,
        RpcOptions,
        TxHandle,
        TxOptions,
    },
    traits::{
        CacheTransport,
        CacheValue,
        Codec,
        DeleteOutcome,
        QueryEngine,
        SetItem,
        SetPolicy,
        Stub,
    },
};

/// A flat string-property entity, enough structure for exercising the core.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEntity {
    pub key: Key,
    pub props: BTreeMap<String, String>,
}

impl TestEntity {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            props: BTreeMap::new(),
        }
    }

    pub fn with_prop(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(name.into(), value.into());
        self
    }
}

/// JSON codec over [`TestEntity`].
pub struct TestCodec;

impl Codec for TestCodec {
    type Entity = TestEntity;

    fn encode(&self, entity: &TestEntity) -> anyhow::Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(entity)?))
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<TestEntity> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn key_of(&self, entity: &TestEntity) -> Key {
        entity.key.clone()
    }

    fn with_key(&self, entity: &TestEntity, key: Key) -> TestEntity {
        let mut entity = entity.clone();
        entity.key = key;
        entity
    }
}

/// One recorded transport call: the operation name and how many keys (or
/// entries) it carried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StubCall {
    pub op: &'static str,
    pub keys: usize,
}

struct TxState {
    /// Buffered writes: `None` marks a delete.
    mutations: BTreeMap<Key, Option<Bytes>>,
}

struct CacheEntry {
    value: Bytes,
    cas_id: u64,
}

struct StoreInner {
    records: BTreeMap<Key, Bytes>,
    next_id: i64,
    next_tx: u64,
    txes: HashMap<u64, TxState>,
    calls: Vec<StubCall>,
    fail_next: HashMap<&'static str, u32>,
    cache: HashMap<(String, String), CacheEntry>,
    next_cas: u64,
}

/// The in-memory backend. One instance implements [`Stub`],
/// [`QueryEngine`], and [`CacheTransport`] over shared state.
pub struct TestStore {
    inner: Mutex<StoreInner>,
}

impl TestStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StoreInner {
                records: BTreeMap::new(),
                next_id: 1,
                next_tx: 1,
                txes: HashMap::new(),
                calls: Vec::new(),
                fail_next: HashMap::new(),
                cache: HashMap::new(),
                next_cas: 1,
            }),
        })
    }

    pub fn calls(&self) -> Vec<StubCall> {
        self.inner.lock().calls.clone()
    }

    /// Number of recorded calls for one operation name.
    pub fn count(&self, op: &str) -> usize {
        self.inner.lock().calls.iter().filter(|c| c.op == op).count()
    }

    /// Make the next `times` calls to `op` fail. Commit failures are
    /// retryable transaction conflicts; everything else fails as a plain
    /// transport error.
    pub fn fail_next(&self, op: &'static str, times: u32) {
        self.inner.lock().fail_next.insert(op, times);
    }

    /// Seed a record directly, bypassing the stub surface.
    pub fn seed(&self, key: Key, bytes: Bytes) {
        self.inner.lock().records.insert(key, bytes);
    }

    pub fn record(&self, key: &Key) -> Option<Bytes> {
        self.inner.lock().records.get(key).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn open_tx_count(&self) -> usize {
        self.inner.lock().txes.len()
    }

    /// Shared-cache inspection.
    pub fn cache_value(&self, namespace: &str, key: &str) -> Option<Bytes> {
        self.inner
            .lock()
            .cache
            .get(&(namespace.to_string(), key.to_string()))
            .map(|entry| entry.value.clone())
    }

    pub fn cache_len(&self) -> usize {
        self.inner.lock().cache.len()
    }

    fn log(&self, op: &'static str, keys: usize) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(StubCall { op, keys });
        match inner.fail_next.get_mut(op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                if op == "commit" {
                    Err(anyhow::Error::new(ClientError::TransactionFailed {
                        retryable: true,
                        reason: "concurrent modification".to_string(),
                    }))
                } else {
                    Err(anyhow::anyhow!("injected {op} failure"))
                }
            },
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Stub for TestStore {
    async fn get_multi(
        &self,
        tx: Option<TxHandle>,
        keys: Vec<Key>,
        _options: RpcOptions,
    ) -> anyhow::Result<HashMap<Key, Bytes>> {
        self.log("get", keys.len())?;
        let inner = self.inner.lock();
        let mut results = HashMap::new();
        for key in keys {
            let buffered = tx
                .and_then(|tx| inner.txes.get(&tx.0))
                .and_then(|state| state.mutations.get(&key).cloned());
            let value = match buffered {
                Some(mutation) => mutation,
                None => inner.records.get(&key).cloned(),
            };
            if let Some(bytes) = value {
                results.insert(key, bytes);
            }
        }
        Ok(results)
    }

    async fn put_multi(
        &self,
        tx: Option<TxHandle>,
        entities: Vec<(Key, Bytes)>,
        _options: RpcOptions,
    ) -> anyhow::Result<Vec<Key>> {
        self.log("put", entities.len())?;
        let mut inner = self.inner.lock();
        let mut finals = Vec::with_capacity(entities.len());
        for (key, bytes) in entities {
            let final_key = if key.is_complete() {
                key
            } else {
                let id = inner.next_id;
                inner.next_id += 1;
                key.with_assigned_id(id)
            };
            match tx {
                Some(tx) => {
                    let state = inner
                        .txes
                        .get_mut(&tx.0)
                        .ok_or_else(|| anyhow::anyhow!("unknown transaction {}", tx.0))?;
                    state.mutations.insert(final_key.clone(), Some(bytes));
                },
                None => {
                    inner.records.insert(final_key.clone(), bytes);
                },
            }
            finals.push(final_key);
        }
        Ok(finals)
    }

    async fn delete_multi(
        &self,
        tx: Option<TxHandle>,
        keys: Vec<Key>,
        _options: RpcOptions,
    ) -> anyhow::Result<()> {
        self.log("delete", keys.len())?;
        let mut inner = self.inner.lock();
        for key in keys {
            match tx {
                Some(tx) => {
                    let state = inner
                        .txes
                        .get_mut(&tx.0)
                        .ok_or_else(|| anyhow::anyhow!("unknown transaction {}", tx.0))?;
                    state.mutations.insert(key, None);
                },
                None => {
                    inner.records.remove(&key);
                },
            }
        }
        Ok(())
    }

    async fn allocate_ids_multi(
        &self,
        requests: Vec<(Key, IdRequest)>,
        _options: RpcOptions,
    ) -> anyhow::Result<Vec<(i64, i64)>> {
        self.log("allocate_ids", requests.len())?;
        let mut inner = self.inner.lock();
        let mut ranges = Vec::with_capacity(requests.len());
        for (_parent, request) in requests {
            let lo = inner.next_id;
            let hi = match request {
                IdRequest::Size(size) => {
                    let size = i64::try_from(size)
                        .map_err(|_| ClientError::validation("id range size overflows"))?;
                    lo + size - 1
                },
                IdRequest::Max(max) => max.max(lo - 1),
            };
            inner.next_id = hi + 1;
            ranges.push((lo, hi));
        }
        Ok(ranges)
    }

    async fn begin_tx(&self, _options: TxOptions) -> anyhow::Result<TxHandle> {
        self.log("begin_tx", 0)?;
        let mut inner = self.inner.lock();
        let id = inner.next_tx;
        inner.next_tx += 1;
        inner.txes.insert(
            id,
            TxState {
                mutations: BTreeMap::new(),
            },
        );
        Ok(TxHandle(id))
    }

    async fn commit(&self, tx: TxHandle) -> anyhow::Result<()> {
        self.log("commit", 0)?;
        let mut inner = self.inner.lock();
        let state = inner
            .txes
            .remove(&tx.0)
            .ok_or_else(|| anyhow::anyhow!("unknown transaction {}", tx.0))?;
        for (key, mutation) in state.mutations {
            match mutation {
                Some(bytes) => {
                    inner.records.insert(key, bytes);
                },
                None => {
                    inner.records.remove(&key);
                },
            }
        }
        Ok(())
    }

    async fn rollback(&self, tx: TxHandle) -> anyhow::Result<()> {
        self.log("rollback", 0)?;
        // Idempotent: the transaction may already be gone after a failed
        // commit consumed its failure budget.
        self.inner.lock().txes.remove(&tx.0);
        Ok(())
    }
}

impl QueryEngine for TestStore {
    fn run(
        &self,
        query: Query,
        _options: RpcOptions,
    ) -> BoxStream<'static, anyhow::Result<(Key, Bytes)>> {
        if self.log("query", 0).is_err() {
            return Box::pin(stream::iter(vec![Err(anyhow::anyhow!(
                "injected query failure"
            ))]));
        }
        let inner = self.inner.lock();
        let mut items: Vec<anyhow::Result<(Key, Bytes)>> = Vec::new();
        for (key, bytes) in &inner.records {
            if key.kind() != query.kind {
                continue;
            }
            if let Some(ancestor) = &query.ancestor {
                if !ancestor.is_ancestor_of(key) {
                    continue;
                }
            }
            items.push(Ok((key.clone(), bytes.clone())));
            if let Some(limit) = query.limit {
                if items.len() >= limit {
                    break;
                }
            }
        }
        Box::pin(stream::iter(items))
    }
}

#[async_trait]
impl CacheTransport for TestStore {
    async fn get_multi(
        &self,
        keys: Vec<String>,
        for_cas: bool,
        namespace: String,
        _deadline: Option<Duration>,
    ) -> anyhow::Result<HashMap<String, CacheValue>> {
        self.log("cache_get", keys.len())?;
        let inner = self.inner.lock();
        let mut results = HashMap::new();
        for key in keys {
            if let Some(entry) = inner.cache.get(&(namespace.clone(), key.clone())) {
                results.insert(
                    key,
                    CacheValue {
                        bytes: entry.value.clone(),
                        cas_id: for_cas.then_some(entry.cas_id),
                    },
                );
            }
        }
        Ok(results)
    }

    async fn set_multi(
        &self,
        policy: SetPolicy,
        entries: Vec<(String, SetItem)>,
        _ttl: Option<Duration>,
        namespace: String,
        _deadline: Option<Duration>,
    ) -> anyhow::Result<HashMap<String, bool>> {
        self.log("cache_set", entries.len())?;
        let mut inner = self.inner.lock();
        let mut results = HashMap::new();
        for (key, item) in entries {
            let slot = (namespace.clone(), key.clone());
            let existing_cas = inner.cache.get(&slot).map(|entry| entry.cas_id);
            let store = match policy {
                SetPolicy::Set => true,
                SetPolicy::Add => existing_cas.is_none(),
                SetPolicy::Replace => existing_cas.is_some(),
                SetPolicy::Cas => existing_cas.is_some() && existing_cas == item.cas_id,
            };
            if store {
                let cas_id = inner.next_cas;
                inner.next_cas += 1;
                inner.cache.insert(
                    slot,
                    CacheEntry {
                        value: item.value,
                        cas_id,
                    },
                );
            }
            results.insert(key, store);
        }
        Ok(results)
    }

    async fn delete_multi(
        &self,
        keys: Vec<String>,
        _grace: Option<Duration>,
        namespace: String,
        _deadline: Option<Duration>,
    ) -> anyhow::Result<HashMap<String, DeleteOutcome>> {
        self.log("cache_delete", keys.len())?;
        let mut inner = self.inner.lock();
        let mut results = HashMap::new();
        for key in keys {
            let outcome = match inner.cache.remove(&(namespace.clone(), key.clone())) {
                Some(_) => DeleteOutcome::Deleted,
                None => DeleteOutcome::Missing,
            };
            results.insert(key, outcome);
        }
        Ok(results)
    }

    async fn offset_multi(
        &self,
        deltas: Vec<(String, i64)>,
        initial: Option<u64>,
        namespace: String,
        _deadline: Option<Duration>,
    ) -> anyhow::Result<HashMap<String, Option<u64>>> {
        self.log("cache_offset", deltas.len())?;
        let mut inner = self.inner.lock();
        let mut results = HashMap::new();
        for (key, delta) in deltas {
            let slot = (namespace.clone(), key.clone());
            let current: Option<u64> = match inner.cache.get(&slot) {
                Some(entry) => Some(
                    std::str::from_utf8(&entry.value)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| {
                            ClientError::validation(format!("counter {key} is not numeric"))
                        })?,
                ),
                None => initial,
            };
            let updated = current.map(|value| {
                // Counters saturate at zero instead of wrapping.
                let next = (value as i128) + (delta as i128);
                next.clamp(0, u64::MAX as i128) as u64
            });
            if let Some(value) = updated {
                let cas_id = inner.next_cas;
                inner.next_cas += 1;
                inner.cache.insert(
                    slot,
                    CacheEntry {
                        value: Bytes::from(value.to_string()),
                        cas_id,
                    },
                );
            }
            results.insert(key, updated);
        }
        Ok(results)
    }
}
