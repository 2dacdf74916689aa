//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::error::{Result, TollgateError};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Token bucket configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Admission behavior configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Shared state store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Identity resolution configuration
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

/// Token bucket parameters, immutable after startup.
///
/// Both values are embedded in every storage key, so changing them between
/// deployments starts fresh buckets instead of reinterpreting old state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum number of tokens a bucket can hold
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Time window in which `capacity` tokens are fully replenished, in milliseconds
    #[serde(default = "default_refill_interval")]
    pub refill_interval_ms: u64,

    /// Per-key time-to-live for bucket state, in milliseconds.
    /// Defaults to ten refill intervals when unset.
    pub bucket_ttl_ms: Option<u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_interval_ms: default_refill_interval(),
            bucket_ttl_ms: None,
        }
    }
}

fn default_capacity() -> u64 {
    100
}

fn default_refill_interval() -> u64 {
    1000
}

impl RateLimitConfig {
    /// Effective bucket TTL in milliseconds.
    ///
    /// Never shorter than one refill interval, so an in-window bucket cannot
    /// expire before it would have refilled anyway.
    pub fn effective_ttl_ms(&self) -> u64 {
        self.bucket_ttl_ms
            .unwrap_or(self.refill_interval_ms.saturating_mul(10))
            .max(self.refill_interval_ms)
    }

    /// Validate the parameters.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(TollgateError::Config(
                "rate_limit.capacity must be greater than zero".to_string(),
            ));
        }
        if self.refill_interval_ms == 0 {
            return Err(TollgateError::Config(
                "rate_limit.refill_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Admission behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Behavior when the state store or resolver is unreachable
    #[serde(default)]
    pub fail_policy: FailPolicy,

    /// Timeout for each store operation, in milliseconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Maximum number of compare-and-swap attempts per admission check
    #[serde(default = "default_cas_retry_limit")]
    pub cas_retry_limit: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            fail_policy: FailPolicy::default(),
            store_timeout_ms: default_store_timeout(),
            cas_retry_limit: default_cas_retry_limit(),
        }
    }
}

fn default_store_timeout() -> u64 {
    50
}

fn default_cas_retry_limit() -> u32 {
    8
}

/// Behavior when a dependency on the admission path is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    /// Admit traffic when the store is unreachable
    Open,
    /// Reject traffic when the store is unreachable
    #[default]
    Closed,
}

/// Shared state store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local store; correct only for single-instance deployments
    #[default]
    Memory,
    /// Redis-backed store shared across gateway instances
    Redis {
        /// Redis connection URL
        url: String,
    },
}

/// Identity resolution configuration.
///
/// The static token map stands in for a deployment's identity service; the
/// `IdentityResolver` trait is the seam for plugging in a real one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Map of access credential to resolved identity
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

impl TollgateConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TollgateConfig = serde_yaml::from_str(&contents)
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.rate_limit.validate()?;
        Ok(config)
    }
}
