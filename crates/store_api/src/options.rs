//! Wire-level option types. These participate in batch formation: calls
//! coalesce only when their options compare equal, so everything here is
//! `Eq + Hash`.

use std::time::Duration;

use crate::key::Key;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ReadPolicy {
    #[default]
    Strong,
    Eventual,
}

/// Options forwarded with every storage RPC.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct RpcOptions {
    pub deadline: Option<Duration>,
    pub read_policy: ReadPolicy,
}

/// Handle to an open transaction on the remote store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TxHandle(pub u64);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct TxOptions {
    /// The entity group the transaction is serialized over. `None` asks the
    /// store to infer it from the first key touched.
    pub entity_group: Option<Key>,
    pub read_only: bool,
}

/// An id-allocation request against a parent key's numeric id space.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IdRequest {
    /// Reserve exactly this many ids.
    Size(u64),
    /// Reserve all ids up to and including this maximum.
    Max(i64),
}

/// A query over one kind, optionally restricted to an ancestor's subtree.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Query {
    pub kind: String,
    pub ancestor: Option<Key>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ancestor: None,
            limit: None,
        }
    }

    pub fn with_ancestor(mut self, ancestor: Key) -> Self {
        self.ancestor = Some(ancestor);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
