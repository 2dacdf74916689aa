//! In-memory bucket store.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::BucketStore;
use crate::admission::TokenBucketState;
use crate::error::Result;

/// Process-local bucket store backed by a concurrent map.
///
/// The compare-and-swap is atomic within this process only; deployments
/// running more than one gateway instance must use a shared backend such as
/// [`RedisStore`](super::RedisStore) instead.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredBucket>,
}

struct StoredBucket {
    state: TokenBucketState,
    expires_at: Instant,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) buckets currently held.
    pub fn bucket_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.expires_at > now)
            .count()
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn fetch(&self, key: &str) -> Result<Option<TokenBucketState>> {
        let now = Instant::now();
        // The read guard must drop before remove_if touches the same shard.
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.state));
            }
        }
        self.entries.remove_if(key, |_, v| v.expires_at <= now);
        Ok(None)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&TokenBucketState>,
        next: &TokenBucketState,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let live = occupied.get().expires_at > now;
                let matches = match expected {
                    Some(prev) => live && occupied.get().state == *prev,
                    None => !live,
                };
                if matches {
                    occupied.insert(StoredBucket {
                        state: *next,
                        expires_at: now + ttl,
                    });
                    Ok(true)
                } else {
                    if !live {
                        occupied.remove();
                    }
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(StoredBucket {
                        state: *next,
                        expires_at: now + ttl,
                    });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }
}
