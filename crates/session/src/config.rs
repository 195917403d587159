//! Session-wide knobs, fixed at context construction.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    /// Bucket size at which a batcher flushes without waiting for an idle
    /// turn.
    pub auto_batch_limit: usize,
    /// Per-batch item cap for the shared-cache batchers, bounded by the
    /// transport's multi-call limit.
    pub max_remote_cache_items: usize,
    /// Prefix namespacing every shared-cache key; bump it to invalidate all
    /// previously written values.
    pub remote_cache_prefix: String,
    /// Applied to RPCs whose options carry no deadline.
    pub default_deadline: Option<Duration>,
    /// Commit-conflict retries before a transaction surfaces its failure.
    pub transaction_retries: u32,
    /// TTL for read-through writes into the shared cache when the TTL
    /// policy declines to choose; `None` stores without expiry.
    pub remote_cache_ttl: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_batch_limit: 100,
            max_remote_cache_items: remote_cache::DEFAULT_BATCH_LIMIT,
            remote_cache_prefix: remote_cache::DEFAULT_CACHE_PREFIX.to_string(),
            default_deadline: None,
            transaction_retries: 3,
            remote_cache_ttl: None,
        }
    }
}
