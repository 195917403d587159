//! Shared error taxonomy for the entity-store client.
//!
//! Operations propagate `anyhow::Error` chains. A [`ClientError`] can be
//! attached anywhere in the chain via `.context(..)` and recovered with
//! `downcast_ref`, which is how callers classify failures (retryable
//! transaction conflicts, queue exhaustion, deadlocks) without the layers in
//! between knowing about each other.

use std::sync::Arc;

/// Classification attachable to an `anyhow` chain.
///
/// A missing entity is deliberately not represented here: "not found" is a
/// `None` result, not an error.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum ClientError {
    /// Bad argument shape at the public API surface.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// A key's kind does not match the model it is being used with.
    #[error("key kind {actual:?} does not match expected kind {expected:?}")]
    KindMismatch { expected: String, actual: String },

    /// A transaction could not commit. Retryable conflicts are re-attempted
    /// by the session layer before this surfaces to the caller.
    #[error("transaction failed (retryable: {retryable}): {reason}")]
    TransactionFailed { retryable: bool, reason: String },

    /// Transport-level failure, with the underlying cause flattened into the
    /// message so the error stays cloneable across fan-out.
    #[error("rpc failed: {0}")]
    Rpc(String),

    /// The event loop drained with futures still pending. The dump lists
    /// every pending future and its creation site.
    #[error("event loop deadlock; pending futures:\n{dump}")]
    Deadlock { dump: String },

    /// Sentinel delivered by queue futures once drained and completed.
    #[error("queue is empty")]
    EndOfQueue,

    /// Assignment to a computed-only attribute. Raised by model layers built
    /// on top of this crate; defined here so classification is uniform.
    #[error("cannot assign to computed property {0}")]
    ComputedWrite(String),
}

impl ClientError {
    pub fn validation(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(ClientError::Validation(msg.into()))
    }

    pub fn rpc(cause: &anyhow::Error) -> anyhow::Error {
        anyhow::Error::new(ClientError::Rpc(format!("{cause:#}")))
    }
}

/// True iff the chain carries a retryable [`ClientError::TransactionFailed`].
pub fn is_retryable(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ClientError>(),
        Some(ClientError::TransactionFailed {
            retryable: true,
            ..
        })
    )
}

pub fn is_end_of_queue(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ClientError>(),
        Some(ClientError::EndOfQueue)
    )
}

pub fn is_deadlock(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ClientError>(),
        Some(ClientError::Deadlock { .. })
    )
}

/// A completed future may be observed by several callers, so stored failures
/// are `Arc<anyhow::Error>`. Each observer gets a fresh error that keeps the
/// original chain in its message and re-attaches the `ClientError`
/// classification so `downcast_ref` still works downstream.
pub fn reshare(err: &Arc<anyhow::Error>) -> anyhow::Error {
    let new_error = anyhow::anyhow!("{err:#}");
    match err.downcast_ref::<ClientError>() {
        Some(classified) => new_error.context(classified.clone()),
        None => new_error,
    }
}
