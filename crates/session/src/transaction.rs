//! Transactional scoping: child contexts, commit retries, and write-set
//! merge-back.

use std::{
    sync::Arc,
    time::Duration,
};

use errors::ClientError;
use futures::future::BoxFuture;
use store_api::{
    Codec,
    Key,
    TxHandle,
    TxOptions,
};
use tasklets::{
    sleep,
    Promise,
};

use crate::{
    cache::CacheEntry,
    context::Context,
    retry::RetrySchedule,
};

/// The transaction body. Invoked once per attempt, so it must be repeatable;
/// it receives the transactional child context explicitly (the same context
/// is also installed as the ambient one for the duration of the attempt).
pub type TxCallback<C, T> =
    Arc<dyn Fn(Context<C>) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// Constructor for [`Context::get_or_insert`]'s insert path.
pub type EntityBuilder<C> = Arc<dyn Fn() -> <C as Codec>::Entity + Send + Sync>;

#[derive(Clone, Debug, Default)]
pub struct TransactionOptions {
    /// Commit-conflict retries; defaults to the context's configured count.
    pub retries: Option<u32>,
    /// The entity group to serialize over. Required unless
    /// `infer_entity_group` is set, in which case the store infers it from
    /// the first key touched.
    pub entity_group: Option<Key>,
    pub infer_entity_group: bool,
    pub read_only: bool,
}

const FIRST_RETRY_CAP: Duration = Duration::from_millis(5);
const RETRY_CEILING: Duration = Duration::from_millis(250);

impl<C: Codec> Context<C> {
    /// Run `callback` against a transactional child context and commit its
    /// writes.
    ///
    /// The child sees its own private session cache; nothing it writes is
    /// visible through this context until the commit succeeds, at which
    /// point the child's write set is merged in and the touched keys are
    /// invalidated in the shared cache. Retryable commit conflicts re-run
    /// the callback on a fresh child after a jittered backoff.
    pub fn transaction<T: Clone + Send + 'static>(
        &self,
        options: TransactionOptions,
        callback: TxCallback<C, T>,
    ) -> Promise<T> {
        if self.in_transaction() {
            return Promise::rejected(
                &self.inner.ev,
                ClientError::validation("nested transactions are not supported"),
            );
        }
        if options.entity_group.is_none() && !options.infer_entity_group {
            return Promise::rejected(
                &self.inner.ev,
                ClientError::validation(
                    "transaction requires an entity group; set infer_entity_group to let the \
                     store infer one from the first key touched",
                ),
            );
        }
        let this = self.clone();
        self.inner.ev.spawn("context.transaction", async move {
            let mut attempts_left = options
                .retries
                .unwrap_or(this.inner.config.transaction_retries);
            let mut retry_delays = RetrySchedule::new(FIRST_RETRY_CAP, RETRY_CEILING);
            loop {
                let tx = {
                    let stub = this.inner.stub.clone();
                    let tx_options = TxOptions {
                        entity_group: options.entity_group.clone(),
                        read_only: options.read_only,
                    };
                    this.inner
                        .ev
                        .queue_rpc("rpc.begin_tx", async move { stub.begin_tx(tx_options).await })
                        .await?
                };
                let child = this.transactional_child(tx);
                // The child is the ambient context for the scope of the
                // callback; the previous value comes back on every exit
                // path so nested code can never leak the outer context.
                let saved = tasklets::swap_ambient_context(Some(
                    Arc::new(child.clone()) as tasklets::AmbientContext
                ));
                let callback_result = callback(child.clone()).await;
                tasklets::set_ambient_context(saved);
                let value = match callback_result {
                    Ok(value) => value,
                    Err(err) => {
                        this.rollback_quietly(tx).await;
                        return Err(err);
                    },
                };
                let commit = {
                    let stub = this.inner.stub.clone();
                    this.inner
                        .ev
                        .queue_rpc("rpc.commit", async move { stub.commit(tx).await })
                        .await
                };
                match commit {
                    Ok(()) => {
                        this.absorb_child(&child).await;
                        return Ok(value);
                    },
                    Err(err) if errors::is_retryable(&err) && attempts_left > 0 => {
                        attempts_left -= 1;
                        tracing::info!(
                            "transaction commit conflicted, retrying \
                             ({attempts_left} attempts left): {err:#}"
                        );
                        this.rollback_quietly(tx).await;
                        let delay = retry_delays.next_delay(&mut rand::rng());
                        sleep(&this.inner.ev, delay).await?;
                    },
                    Err(err) => {
                        this.rollback_quietly(tx).await;
                        let err = match err.downcast_ref::<ClientError>() {
                            Some(ClientError::TransactionFailed { .. }) => err,
                            _ => anyhow::Error::new(ClientError::TransactionFailed {
                                retryable: false,
                                reason: format!("{err:#}"),
                            }),
                        };
                        return Err(err);
                    },
                }
            }
        })
    }

    /// Fetch `key`, inserting the built entity if it is absent. Runs
    /// transactionally, so concurrent callers converge on one entity.
    pub fn get_or_insert(&self, key: &Key, build: EntityBuilder<C>) -> Promise<C::Entity> {
        if !key.is_complete() {
            return Promise::rejected(
                &self.inner.ev,
                ClientError::validation("get_or_insert requires a complete key"),
            );
        }
        let options = TransactionOptions {
            entity_group: Some(key.root()),
            ..Default::default()
        };
        let wanted = key.clone();
        let callback: TxCallback<C, C::Entity> = Arc::new(move |ctx: Context<C>| {
            let wanted = wanted.clone();
            let build = build.clone();
            Box::pin(async move {
                if let Some(existing) = ctx.get(&wanted).await? {
                    return Ok(existing);
                }
                let entity = build();
                let built_key = ctx.codec().key_of(&entity);
                if built_key.kind() != wanted.kind() {
                    return Err(anyhow::Error::new(ClientError::KindMismatch {
                        expected: wanted.kind().to_string(),
                        actual: built_key.kind().to_string(),
                    }));
                }
                if built_key != wanted {
                    return Err(ClientError::validation(format!(
                        "built entity key {built_key} does not match {wanted}"
                    )));
                }
                ctx.put(&entity).await?;
                Ok(entity)
            })
        });
        self.transaction(options, callback)
    }

    /// A child context bound to `tx`: fresh private session cache, batchers
    /// issuing under the transaction, no shared-cache participation.
    fn transactional_child(&self, tx: TxHandle) -> Context<C> {
        Context::from_parts(
            self.inner.ev.clone(),
            self.inner.codec.clone(),
            self.inner.stub.clone(),
            self.inner.query_engine.clone(),
            Some(tx),
            Some(self.clone()),
            self.inner.config.clone(),
            self.inner.policies.clone(),
            None,
        )
    }

    /// Merge a committed child's write set into this context's cache and
    /// invalidate the touched keys in the shared cache.
    async fn absorb_child(&self, child: &Context<C>) {
        let written: Vec<(Key, CacheEntry<C::Entity>)> = {
            let child_cache = child.inner.cache.lock();
            child_cache
                .writes
                .iter()
                .filter_map(|key| {
                    child_cache
                        .entries
                        .get(key)
                        .cloned()
                        .map(|entry| (key.clone(), entry))
                })
                .collect()
        };
        {
            let mut cache = self.inner.cache.lock();
            for (key, entry) in &written {
                if (self.inner.policies.cache)(key) {
                    cache.entries.insert(key.clone(), entry.clone());
                    cache.writes.insert(key.clone());
                }
            }
        }
        for (key, _) in written {
            self.invalidate_remote(&key, None).await;
        }
    }

    async fn rollback_quietly(&self, tx: TxHandle) {
        let stub = self.inner.stub.clone();
        let rollback = self
            .inner
            .ev
            .queue_rpc("rpc.rollback", async move { stub.rollback(tx).await });
        if let Err(err) = rollback.await {
            tracing::warn!("transaction rollback failed: {err:#}");
        }
    }
}
