//! Distributed token bucket limiter.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::{debug, trace, warn};

use super::bucket::{BucketKey, TokenBucketState};
use crate::config::{AdmissionConfig, RateLimitConfig};
use crate::error::{Result, TollgateError};
use crate::store::BucketStore;

/// Continuous token bucket over a shared state store.
///
/// Refill is computed lazily on each request instead of by a background task:
/// the elapsed time since the last update grants tokens proportionally, which
/// avoids the burst-at-boundary artifact of fixed windows. Every state write
/// is an atomic compare-and-swap against the previously read value, retried
/// on conflict, so concurrent checks for the same identity never over-admit
/// even across separate gateway instances.
pub struct TokenBucketLimiter {
    /// The shared state store
    store: Arc<dyn BucketStore>,
    /// Maximum tokens a bucket can hold
    capacity: u64,
    /// Window in which `capacity` tokens fully replenish, in milliseconds
    refill_interval_ms: u64,
    /// TTL applied to bucket keys on every write
    bucket_ttl: Duration,
    /// Per-operation store timeout
    store_timeout: Duration,
    /// Maximum compare-and-swap attempts before giving up
    cas_retry_limit: u32,
}

impl TokenBucketLimiter {
    /// Create a new limiter over the given store.
    pub fn new(
        store: Arc<dyn BucketStore>,
        rate_limit: &RateLimitConfig,
        admission: &AdmissionConfig,
    ) -> Self {
        Self {
            store,
            capacity: rate_limit.capacity,
            refill_interval_ms: rate_limit.refill_interval_ms,
            bucket_ttl: Duration::from_millis(rate_limit.effective_ttl_ms()),
            store_timeout: Duration::from_millis(admission.store_timeout_ms),
            cas_retry_limit: admission.cas_retry_limit,
        }
    }

    /// Check whether a request from `identity` may proceed, consuming one
    /// token if so.
    pub async fn allow(&self, identity: &str) -> Result<bool> {
        // A clock before the epoch collapses to 0 rather than panicking the
        // request task; the bucket math tolerates a zero timestamp.
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.allow_at(identity, now_ms).await
    }

    /// Check admission at an explicit timestamp. Split out from [`allow`]
    /// so tests can drive the clock.
    ///
    /// [`allow`]: TokenBucketLimiter::allow
    pub async fn allow_at(&self, identity: &str, now_ms: u64) -> Result<bool> {
        let key = BucketKey::new(self.refill_interval_ms, self.capacity, identity);
        let storage_key = key.to_storage_key();

        for attempt in 0..self.cas_retry_limit {
            let current = self
                .with_timeout(self.store.fetch(&storage_key))
                .await?;
            let (next, admitted) = self.next_state(current.as_ref(), now_ms);

            let swapped = self
                .with_timeout(self.store.compare_and_swap(
                    &storage_key,
                    current.as_ref(),
                    &next,
                    self.bucket_ttl,
                ))
                .await?;

            if swapped {
                trace!(
                    key = %key,
                    admitted = admitted,
                    remaining = next.tokens_remaining,
                    attempt = attempt,
                    "Token bucket updated"
                );
                if !admitted {
                    debug!(key = %key, "Rate limit exceeded");
                }
                return Ok(admitted);
            }

            // Another writer updated the bucket between our read and write.
            // Back off briefly so contending writers spread out, then retry
            // against the fresh state.
            let jitter_us = rand::thread_rng().gen_range(50..500);
            tokio::time::sleep(Duration::from_micros(jitter_us)).await;
        }

        warn!(key = %key, retries = self.cas_retry_limit, "Bucket update contention exhausted retries");
        Err(TollgateError::StoreUnavailable(format!(
            "compare-and-swap did not converge after {} attempts",
            self.cas_retry_limit
        )))
    }

    /// Compute the successor state and the admission verdict for one request.
    fn next_state(
        &self,
        current: Option<&TokenBucketState>,
        now_ms: u64,
    ) -> (TokenBucketState, bool) {
        let Some(state) = current else {
            // First request from a new identity is always admitted and leaves
            // a full bucket minus the token it consumed.
            return (
                TokenBucketState {
                    last_refill_time: now_ms,
                    tokens_remaining: self.capacity - 1,
                },
                true,
            );
        };

        let available = self.available_tokens(state, now_ms);
        if available == 0 {
            // Keep last_refill_time untouched: the denied request earns no
            // refill credit, and moving the timestamp forward would stall the
            // bucket under sustained pressure.
            (
                TokenBucketState {
                    last_refill_time: state.last_refill_time,
                    tokens_remaining: 0,
                },
                false,
            )
        } else {
            (
                TokenBucketState {
                    // max() keeps the timestamp monotonic if the wall clock
                    // stepped backwards between requests.
                    last_refill_time: now_ms.max(state.last_refill_time),
                    tokens_remaining: available - 1,
                },
                true,
            )
        }
    }

    /// Tokens available at `now_ms` after applying the lazy refill.
    fn available_tokens(&self, state: &TokenBucketState, now_ms: u64) -> u64 {
        let elapsed = now_ms.saturating_sub(state.last_refill_time);
        if elapsed > self.refill_interval_ms {
            return self.capacity;
        }

        // Widened intermediate: elapsed * capacity stays exact for any
        // representable capacity, and dividing the product avoids the
        // truncate-to-zero trap of computing an integer interval-per-token
        // first.
        let granted =
            (elapsed as u128 * self.capacity as u128 / self.refill_interval_ms as u128) as u64;
        state
            .tokens_remaining
            .saturating_add(granted)
            .min(self.capacity)
    }

    async fn with_timeout<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.store_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(TollgateError::StoreUnavailable(format!(
                "store operation exceeded {}ms",
                self.store_timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const T0: u64 = 1_700_000_000_000;

    fn limiter_with(
        store: Arc<dyn BucketStore>,
        capacity: u64,
        refill_interval_ms: u64,
    ) -> TokenBucketLimiter {
        let rate_limit = RateLimitConfig {
            capacity,
            refill_interval_ms,
            bucket_ttl_ms: None,
        };
        TokenBucketLimiter::new(store, &rate_limit, &AdmissionConfig::default())
    }

    async fn stored_state(
        store: &MemoryStore,
        capacity: u64,
        refill_interval_ms: u64,
        identity: &str,
    ) -> TokenBucketState {
        let key = BucketKey::new(refill_interval_ms, capacity, identity).to_storage_key();
        store.fetch(&key).await.unwrap().expect("bucket should exist")
    }

    #[tokio::test]
    async fn test_first_request_admitted_with_full_bucket_minus_one() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter_with(store.clone(), 5, 1000);

        assert!(limiter.allow_at("fresh", T0).await.unwrap());

        let state = stored_state(&store, 5, 1000, "fresh").await;
        assert_eq!(state.tokens_remaining, 4);
        assert_eq!(state.last_refill_time, T0);
    }

    #[tokio::test]
    async fn test_capacity_admissions_then_deny() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter_with(store.clone(), 5, 1000);

        for i in 0..5 {
            assert!(
                limiter.allow_at("user", T0).await.unwrap(),
                "request {} should be admitted",
                i + 1
            );
        }
        assert!(!limiter.allow_at("user", T0).await.unwrap());

        let state = stored_state(&store, 5, 1000, "user").await;
        assert_eq!(state.tokens_remaining, 0);
    }

    #[tokio::test]
    async fn test_denied_request_leaves_refill_time_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter_with(store.clone(), 1, 1000);

        assert!(limiter.allow_at("user", T0).await.unwrap());
        assert!(!limiter.allow_at("user", T0 + 400).await.unwrap());

        // Refill credit accrued before the denial must still count later.
        let state = stored_state(&store, 1, 1000, "user").await;
        assert_eq!(state.last_refill_time, T0);
    }

    #[tokio::test]
    async fn test_full_refill_after_interval() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter_with(store.clone(), 5, 1000);

        for _ in 0..5 {
            limiter.allow_at("user", T0).await.unwrap();
        }
        assert!(!limiter.allow_at("user", T0).await.unwrap());

        assert!(limiter.allow_at("user", T0 + 1001).await.unwrap());
        let state = stored_state(&store, 5, 1000, "user").await;
        assert_eq!(state.tokens_remaining, 4);
    }

    #[tokio::test]
    async fn test_partial_refill_is_proportional() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter_with(store.clone(), 10, 1000);

        for _ in 0..10 {
            assert!(limiter.allow_at("user", T0).await.unwrap());
        }
        assert!(!limiter.allow_at("user", T0).await.unwrap());

        // 500ms at 10 tokens per 1000ms grants exactly 5 tokens; the call
        // itself consumes one.
        assert!(limiter.allow_at("user", T0 + 500).await.unwrap());
        let state = stored_state(&store, 10, 1000, "user").await;
        assert_eq!(state.tokens_remaining, 4);

        for _ in 0..4 {
            assert!(limiter.allow_at("user", T0 + 500).await.unwrap());
        }
        assert!(!limiter.allow_at("user", T0 + 500).await.unwrap());
    }

    #[tokio::test]
    async fn test_refill_exact_on_interval_boundary() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter_with(store.clone(), 4, 1000);

        for _ in 0..4 {
            limiter.allow_at("user", T0).await.unwrap();
        }

        // elapsed == interval takes the proportional path and grants the
        // whole capacity.
        assert!(limiter.allow_at("user", T0 + 1000).await.unwrap());
        let state = stored_state(&store, 4, 1000, "user").await;
        assert_eq!(state.tokens_remaining, 3);
    }

    #[tokio::test]
    async fn test_large_capacity_does_not_truncate_refill() {
        let store = Arc::new(MemoryStore::new());
        // More tokens than milliseconds in the interval: a naive integer
        // interval-per-token would be zero.
        let limiter = limiter_with(store.clone(), 5000, 1000);

        for _ in 0..5000 {
            assert!(limiter.allow_at("user", T0).await.unwrap());
        }
        assert!(!limiter.allow_at("user", T0).await.unwrap());

        // 1ms grants 5 tokens back.
        assert!(limiter.allow_at("user", T0 + 1).await.unwrap());
        let state = stored_state(&store, 5000, 1000, "user").await;
        assert_eq!(state.tokens_remaining, 4);
    }

    #[tokio::test]
    async fn test_zero_timestamp_is_handled() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter_with(store.clone(), 2, 1000);

        // The degenerate timestamp a pre-epoch wall clock collapses to.
        assert!(limiter.allow_at("user", 0).await.unwrap());
        assert!(limiter.allow_at("user", 0).await.unwrap());
        assert!(!limiter.allow_at("user", 0).await.unwrap());

        let state = stored_state(&store, 2, 1000, "user").await;
        assert_eq!(state.last_refill_time, 0);
        assert_eq!(state.tokens_remaining, 0);
    }

    #[tokio::test]
    async fn test_clock_step_backwards_keeps_timestamp_monotonic() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter_with(store.clone(), 5, 1000);

        limiter.allow_at("user", T0).await.unwrap();
        assert!(limiter.allow_at("user", T0 - 100).await.unwrap());

        let state = stored_state(&store, 5, 1000, "user").await;
        assert_eq!(state.last_refill_time, T0);
    }

    #[tokio::test]
    async fn test_tokens_stay_within_bounds_under_random_sequences() {
        let store = Arc::new(MemoryStore::new());
        let capacity = 7;
        let limiter = limiter_with(store.clone(), capacity, 1000);
        let mut rng = StdRng::seed_from_u64(42);

        let mut now = T0;
        for _ in 0..500 {
            now += rng.gen_range(0..400);
            limiter.allow_at("user", now).await.unwrap();

            let state = stored_state(&store, capacity, 1000, "user").await;
            assert!(
                state.tokens_remaining <= capacity,
                "tokens_remaining {} exceeded capacity",
                state.tokens_remaining
            );
        }
    }

    #[tokio::test]
    async fn test_concurrent_checks_admit_at_most_capacity() {
        let store = Arc::new(MemoryStore::new());
        // Long interval so no refill happens during the test.
        let limiter = Arc::new(limiter_with(store, 1, 600_000));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(
                async move { limiter.allow("burst").await.unwrap() },
            ));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1, "capacity 1 must admit exactly one of the burst");
    }

    #[tokio::test]
    async fn test_parameter_change_addresses_fresh_state() {
        let store = Arc::new(MemoryStore::new());
        let small = limiter_with(store.clone(), 1, 1000);
        let large = limiter_with(store.clone(), 5, 1000);

        assert!(small.allow_at("user", T0).await.unwrap());
        assert!(!small.allow_at("user", T0).await.unwrap());

        // A redeployment with different parameters must not inherit the
        // exhausted bucket.
        assert!(large.allow_at("user", T0).await.unwrap());
        assert_eq!(store.bucket_count(), 2);
    }

    /// Store whose writes always lose the compare-and-swap.
    struct ContestedStore;

    #[async_trait]
    impl BucketStore for ContestedStore {
        async fn fetch(&self, _key: &str) -> Result<Option<TokenBucketState>> {
            Ok(None)
        }

        async fn compare_and_swap(
            &self,
            _key: &str,
            _expected: Option<&TokenBucketState>,
            _next: &TokenBucketState,
            _ttl: Duration,
        ) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_unresolvable_contention_reports_store_unavailable() {
        let limiter = limiter_with(Arc::new(ContestedStore), 5, 1000);

        let err = limiter.allow_at("user", T0).await.unwrap_err();
        assert!(matches!(err, TollgateError::StoreUnavailable(_)));
    }

    /// Store that never completes an operation.
    struct StalledStore;

    #[async_trait]
    impl BucketStore for StalledStore {
        async fn fetch(&self, _key: &str) -> Result<Option<TokenBucketState>> {
            std::future::pending().await
        }

        async fn compare_and_swap(
            &self,
            _key: &str,
            _expected: Option<&TokenBucketState>,
            _next: &TokenBucketState,
            _ttl: Duration,
        ) -> Result<bool> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stalled_store_times_out() {
        let limiter = limiter_with(Arc::new(StalledStore), 5, 1000);

        let err = limiter.allow_at("user", T0).await.unwrap_err();
        assert!(matches!(err, TollgateError::StoreUnavailable(_)));
    }
}
