//! Token bucket state and storage key generation.

use std::collections::HashMap;

use crate::error::{Result, TollgateError};

/// Storage field holding the timestamp of the last refill.
pub const FIELD_LAST_REFILL_TIME: &str = "lastRefillTime";
/// Storage field holding the remaining token count.
pub const FIELD_TOKENS_REMAINING: &str = "tokensRemaining";

/// Per-identity token bucket record.
///
/// The durable copy lives in the shared store; instances of this type are
/// transient views held only for the duration of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketState {
    /// Milliseconds since epoch of the last time tokens were granted or consumed
    pub last_refill_time: u64,
    /// Tokens currently available, always within `[0, capacity]`
    pub tokens_remaining: u64,
}

impl TokenBucketState {
    /// Serialize to the string-field map stored per key.
    pub fn to_fields(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                FIELD_LAST_REFILL_TIME.to_string(),
                self.last_refill_time.to_string(),
            ),
            (
                FIELD_TOKENS_REMAINING.to_string(),
                self.tokens_remaining.to_string(),
            ),
        ])
    }

    /// Deserialize from the stored string-field map.
    ///
    /// Missing or unparseable fields are an error rather than a fresh bucket,
    /// so corrupted state is never silently converted into a new quota grant.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let last_refill_time = parse_field(fields, FIELD_LAST_REFILL_TIME)?;
        let tokens_remaining = parse_field(fields, FIELD_TOKENS_REMAINING)?;
        Ok(Self {
            last_refill_time,
            tokens_remaining,
        })
    }
}

fn parse_field(fields: &HashMap<String, String>, name: &str) -> Result<u64> {
    let value = fields
        .get(name)
        .ok_or_else(|| TollgateError::CorruptState(format!("missing field {}", name)))?;
    value
        .parse()
        .map_err(|_| TollgateError::CorruptState(format!("field {} is not an integer: {}", name, value)))
}

/// A key that uniquely identifies one identity's bucket in the shared store.
///
/// The limiter parameters are part of the key: a deployment that changes
/// `capacity` or `refill_interval_ms` addresses fresh state instead of
/// reinterpreting old counts under new semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// Refill interval the bucket was created under, in milliseconds
    pub refill_interval_ms: u64,
    /// Capacity the bucket was created under
    pub capacity: u64,
    /// The rate-limiting subject
    pub identity: String,
}

impl BucketKey {
    /// Create a new bucket key.
    pub fn new(refill_interval_ms: u64, capacity: u64, identity: &str) -> Self {
        Self {
            refill_interval_ms,
            capacity,
            identity: identity.to_string(),
        }
    }

    /// Render the key as stored in the shared store.
    pub fn to_storage_key(&self) -> String {
        format!(
            "rate:limiter:{}:{}:{}",
            self.refill_interval_ms, self.capacity, self.identity
        )
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_storage_key())
    }
}
