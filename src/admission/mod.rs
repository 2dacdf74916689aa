//! Request admission: credential gatekeeping and token bucket rate limiting.

mod bucket;
mod gatekeeper;
mod limiter;

pub use bucket::{BucketKey, TokenBucketState, FIELD_LAST_REFILL_TIME, FIELD_TOKENS_REMAINING};
pub use gatekeeper::{AdmissionDecision, AdmissionRequest, Gatekeeper};
pub use limiter::TokenBucketLimiter;
