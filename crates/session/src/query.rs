//! Query integration: mapping result streams through callbacks and into
//! merge futures, with session-cache population.

use std::sync::Arc;

use futures::StreamExt;
use store_api::{
    Codec,
    Key,
    Query,
    RpcOptions,
};
use tasklets::{
    MergeQueue,
    MultiPromise,
    Promise,
    SerialQueuePromise,
};

use crate::{
    cache::CacheEntry,
    context::Context,
};

/// A mapped query value: produced directly, or deferred behind a promise
/// when the mapper is itself a tasklet.
pub enum Mapped<V> {
    Value(V),
    Deferred(Promise<V>),
}

pub type Mapper<E, V> = Arc<dyn Fn(E) -> Mapped<V> + Send + Sync>;

impl<C: Codec> Context<C> {
    /// Run `query`, feed each mapped value into `sink`, and seal the sink
    /// when the stream is exhausted. The returned promise resolves once
    /// everything has been handed over; a stream failure fails both the
    /// sink and the returned promise.
    pub fn map_query_into<V: Clone + Send + 'static>(
        &self,
        query: Query,
        mapper: Mapper<C::Entity, V>,
        sink: Arc<dyn MergeQueue<V>>,
        options: RpcOptions,
    ) -> Promise<()> {
        let this = self.clone();
        let options = self.rpc_options(&options);
        self.inner.ev.spawn("context.map_query", async move {
            let mut stream = this.inner.query_engine.run(query, options);
            let outcome: anyhow::Result<()> = async {
                while let Some(item) = stream.next().await {
                    let (key, bytes) = item?;
                    let decoded = this.inner.codec.decode(&bytes)?;
                    let entity = this.absorb_query_result(&key, decoded);
                    match mapper(entity) {
                        Mapped::Value(value) => sink.putq(value),
                        Mapped::Deferred(dep) => sink.add_dependent(&dep),
                    }
                }
                Ok(())
            }
            .await;
            match outcome {
                Ok(()) => {
                    sink.complete();
                    Ok(())
                },
                Err(err) => {
                    let shared = Arc::new(err);
                    sink.set_exception(errors::reshare(&shared));
                    Err(errors::reshare(&shared))
                },
            }
        })
    }

    /// Run `query` and collect the mapped values, in result order.
    pub fn map_query<V: Clone + Send + 'static>(
        &self,
        query: Query,
        mapper: Mapper<C::Entity, V>,
        options: RpcOptions,
    ) -> Promise<Vec<V>> {
        let results = MultiPromise::new(&self.inner.ev, "context.map_query.results");
        let feed = self.map_query_into(query, mapper, Arc::new(results.clone()), options);
        let collected = results.result().clone();
        self.inner.ev.spawn("context.map_query.collect", async move {
            feed.await?;
            collected.await
        })
    }

    /// Run `query` and collect the entities themselves.
    pub fn fetch_query(&self, query: Query, options: RpcOptions) -> Promise<Vec<C::Entity>> {
        self.map_query(query, Arc::new(Mapped::Value), options)
    }

    /// Run `query`, delivering entities one at a time in result order.
    pub fn iter_query(&self, query: Query, options: RpcOptions) -> SerialQueuePromise<C::Entity> {
        let sink = SerialQueuePromise::new(&self.inner.ev, "context.iter_query");
        let mapper: Mapper<C::Entity, C::Entity> = Arc::new(Mapped::Value);
        let _feed = self.map_query_into(query, mapper, Arc::new(sink.clone()), options);
        sink
    }

    /// Query results populate the session cache but never consult it for
    /// issuing. When a slot already holds a session view of the entity,
    /// that view wins over the store's (the session may be ahead of the
    /// query snapshot); pending reads and tombstones keep their slots.
    fn absorb_query_result(&self, key: &Key, decoded: C::Entity) -> C::Entity {
        if !(self.inner.policies.cache)(key) {
            return decoded;
        }
        let mut cache = self.inner.cache.lock();
        match cache.entries.get(key) {
            Some(CacheEntry::Entity(existing)) => existing.clone(),
            Some(CacheEntry::Pending(_)) | Some(CacheEntry::Tombstone) => decoded,
            None => {
                cache
                    .entries
                    .insert(key.clone(), CacheEntry::Entity(decoded.clone()));
                decoded
            },
        }
    }
}
