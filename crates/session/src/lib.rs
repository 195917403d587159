//! The session layer: a per-request [`Context`] that overlays an in-memory
//! session cache and the shared remote cache over the entity store, routes
//! point operations through auto-batchers, and scopes transactions.
//!
//! One context serves one logical request. Its operations all return
//! promises; work forms into batched RPCs when the event loop goes idle or
//! a batch fills (see the `batcher` crate). An ambient "default context" is
//! kept in the strand-local slot so model-layer conveniences can find the
//! current context without threading it everywhere; transactions swap a
//! child context into that slot for the duration of the body.

mod cache;
mod config;
mod context;
mod query;
mod retry;
mod transaction;


use std::sync::Arc;

use store_api::Codec;
use tasklets::Promise;

pub use crate::{
    cache::{
        CachePolicies,
        KeyPredicate,
        TtlPolicy,
    },
    config::Config,
    context::{
        Context,
        ContextBuilder,
        GetOptions,
        WriteOptions,
    },
    query::{
        Mapped,
        Mapper,
    },
    transaction::{
        EntityBuilder,
        TransactionOptions,
        TxCallback,
    },
};

/// The ambient context for the current strand, if one is installed and its
/// codec type matches.
pub fn get_context<C: Codec>() -> Option<Context<C>> {
    tasklets::ambient_context()
        .and_then(|value| value.downcast::<Context<C>>().ok())
        .map(|ctx| (*ctx).clone())
}

/// Install (or clear) the strand's ambient context.
pub fn set_context<C: Codec>(ctx: Option<&Context<C>>) {
    tasklets::set_ambient_context(ctx.map(|c| Arc::new(c.clone()) as tasklets::AmbientContext));
}

/// Run `callback` in a transaction on the ambient context.
pub fn transactional<C: Codec, T: Clone + Send + 'static>(
    options: TransactionOptions,
    callback: TxCallback<C, T>,
) -> Promise<T> {
    match get_context::<C>() {
        Some(ctx) => ctx.transaction(options, callback),
        None => Promise::rejected(
            &tasklets::EventLoop::current(),
            errors::ClientError::validation("no ambient context installed"),
        ),
    }
}
