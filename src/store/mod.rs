//! Shared bucket state storage.
//!
//! The store is the synchronization point between gateway instances: all
//! limiter writes go through an atomic compare-and-swap, so correctness never
//! depends on a process-local lock.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::admission::TokenBucketState;
use crate::error::Result;

/// Trait for shared bucket state store implementations.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Fetch the current state for a key, or `None` if absent or expired.
    async fn fetch(&self, key: &str) -> Result<Option<TokenBucketState>>;

    /// Atomically replace the state at `key` with `next`, but only if the
    /// currently stored value equals `expected` (`None` meaning the key is
    /// absent). Refreshes the key's TTL on success.
    ///
    /// Returns `true` if the swap was applied, `false` if another writer got
    /// there first and the caller should re-read and retry.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&TokenBucketState>,
        next: &TokenBucketState,
        ttl: Duration,
    ) -> Result<bool>;
}
