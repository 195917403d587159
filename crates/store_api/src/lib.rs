//! Data model and collaborator interfaces for the entity-store client:
//! keys, wire options, and the traits the session layer is written against
//! (entity codec, store transport, query engine, shared-cache transport,
//! namespace resolution).

mod key;
mod options;
mod traits;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use key::{
    Id,
    Key,
    PathElement,
};
pub use options::{
    IdRequest,
    Query,
    ReadPolicy,
    RpcOptions,
    TxHandle,
    TxOptions,
};
pub use traits::{
    CacheTransport,
    CacheValue,
    Codec,
    DefaultNamespace,
    DeleteOutcome,
    NamespaceResolver,
    QueryEngine,
    SetItem,
    SetPolicy,
    Stub,
};
