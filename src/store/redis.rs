//! Redis-backed bucket store.
//!
//! Each bucket is a Redis hash with `lastRefillTime` and `tokensRemaining`
//! fields. The compare-and-swap runs as a server-side Lua script, so the
//! conditional update is atomic across every gateway instance sharing the
//! store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::info;

use super::BucketStore;
use crate::admission::{TokenBucketState, FIELD_LAST_REFILL_TIME, FIELD_TOKENS_REMAINING};
use crate::error::{Result, TollgateError};

/// Compares both hash fields against the expected previous value (empty
/// arguments meaning "key absent"), and only then writes the new state and
/// refreshes the TTL. Returns 1 when the swap applied.
const CAS_SCRIPT: &str = r#"
local last = redis.call('HGET', KEYS[1], 'lastRefillTime')
local tokens = redis.call('HGET', KEYS[1], 'tokensRemaining')
if ARGV[1] == '' then
    if last then return 0 end
else
    if not last or last ~= ARGV[1] or tokens ~= ARGV[2] then return 0 end
end
redis.call('HSET', KEYS[1], 'lastRefillTime', ARGV[3], 'tokensRemaining', ARGV[4])
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return 1
"#;

/// Bucket store backed by a shared Redis instance.
pub struct RedisStore {
    connection: ConnectionManager,
    cas_script: Script,
}

impl RedisStore {
    /// Connect to Redis at the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| TollgateError::Config(format!("invalid Redis URL: {}", e)))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(store_error)?;

        info!(url = %url, "Connected to Redis bucket store");

        Ok(Self {
            connection,
            cas_script: Script::new(CAS_SCRIPT),
        })
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn fetch(&self, key: &str) -> Result<Option<TokenBucketState>> {
        let mut connection = self.connection.clone();
        let fields: std::collections::HashMap<String, String> =
            connection.hgetall(key).await.map_err(store_error)?;

        if fields.is_empty() {
            return Ok(None);
        }
        TokenBucketState::from_fields(&fields).map(Some)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&TokenBucketState>,
        next: &TokenBucketState,
        ttl: Duration,
    ) -> Result<bool> {
        let (expected_refill, expected_tokens) = match expected {
            Some(state) => (
                state.last_refill_time.to_string(),
                state.tokens_remaining.to_string(),
            ),
            None => (String::new(), String::new()),
        };

        let mut connection = self.connection.clone();
        let applied: i64 = self
            .cas_script
            .key(key)
            .arg(expected_refill)
            .arg(expected_tokens)
            .arg(next.last_refill_time)
            .arg(next.tokens_remaining)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut connection)
            .await
            .map_err(store_error)?;

        Ok(applied == 1)
    }
}

fn store_error(e: redis::RedisError) -> TollgateError {
    TollgateError::StoreUnavailable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cas_script_references_storage_fields() {
        // The script is raw Lua; keep its field names in sync with the
        // Rust-side serialization.
        assert!(CAS_SCRIPT.contains(FIELD_LAST_REFILL_TIME));
        assert!(CAS_SCRIPT.contains(FIELD_TOKENS_REMAINING));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = RedisStore::connect("not-a-url").await;
        assert!(matches!(result, Err(TollgateError::Config(_))));
    }
}
