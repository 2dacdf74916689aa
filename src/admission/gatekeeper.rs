//! Pre-routing admission filter.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::limiter::TokenBucketLimiter;
use crate::config::{AdmissionConfig, FailPolicy};
use crate::error::{Result, TollgateError};
use crate::resolver::IdentityResolver;

/// The inbound request view the admission stage operates on.
///
/// Deliberately detached from any HTTP framework type; the pipeline adapter
/// builds one of these from whatever request representation the surrounding
/// gateway uses.
#[derive(Debug)]
pub struct AdmissionRequest {
    /// HTTP method, for the decision log line
    pub method: String,
    /// Request URI, for the decision log line
    pub uri: String,
    /// The access credential, if one was presented
    pub credential: Option<String>,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Let the request continue downstream unchanged
    Forward,
    /// Short-circuit with the given status and machine-readable reason
    Reject {
        /// HTTP status code for the rejection response
        status: u16,
        /// Stable reason token included in the response body
        reason: &'static str,
    },
}

impl AdmissionDecision {
    fn reject(status: u16, reason: &'static str) -> Self {
        Self::Reject { status, reason }
    }
}

/// The admission filter: credential check first, then the rate check.
///
/// All failures are converted to an [`AdmissionDecision`] here; nothing on
/// the request path propagates as an error to the caller.
pub struct Gatekeeper {
    /// External credential-to-identity lookup
    resolver: Arc<dyn IdentityResolver>,
    /// Per-identity token bucket
    limiter: TokenBucketLimiter,
    /// Behavior when the store or resolver is unreachable
    fail_policy: FailPolicy,
    /// Bound on each identity resolution, same budget as store operations
    resolver_timeout: Duration,
}

impl Gatekeeper {
    /// Create a new gatekeeper.
    pub fn new(
        resolver: Arc<dyn IdentityResolver>,
        limiter: TokenBucketLimiter,
        admission: &AdmissionConfig,
    ) -> Self {
        Self {
            resolver,
            limiter,
            fail_policy: admission.fail_policy,
            resolver_timeout: Duration::from_millis(admission.store_timeout_ms),
        }
    }

    /// Decide whether a request may proceed to routing.
    ///
    /// Emits exactly one structured log line per decision, on every path.
    #[instrument(skip(self, request), fields(method = %request.method, uri = %request.uri))]
    pub async fn admit(&self, request: &AdmissionRequest) -> AdmissionDecision {
        let decision = self.decide(request).await;

        match &decision {
            AdmissionDecision::Forward => {
                info!(
                    method = %request.method,
                    uri = %request.uri,
                    outcome = "forward",
                    "Admission decision"
                );
            }
            AdmissionDecision::Reject { status, reason } => {
                info!(
                    method = %request.method,
                    uri = %request.uri,
                    outcome = "reject",
                    status = status,
                    reason = reason,
                    "Admission decision"
                );
            }
        }

        decision
    }

    async fn decide(&self, request: &AdmissionRequest) -> AdmissionDecision {
        // Cheapest check first: a request without a credential never reaches
        // the resolver or the store.
        let Some(credential) = request.credential.as_deref() else {
            return AdmissionDecision::reject(401, "missing_credential");
        };

        let identity = match self.resolve_identity(credential).await {
            Ok(Some(identity)) => identity,
            Ok(None) => return AdmissionDecision::reject(401, "unknown_credential"),
            Err(e) => {
                warn!(error = %e, "Identity resolution failed");
                return self.dependency_failure();
            }
        };

        match self.limiter.allow(&identity).await {
            Ok(true) => AdmissionDecision::Forward,
            Ok(false) => AdmissionDecision::reject(429, "rate_limited"),
            Err(TollgateError::CorruptState(details)) => {
                warn!(identity = %identity, details = %details, "Bucket state is corrupt");
                AdmissionDecision::reject(500, "corrupt_limiter_state")
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "Rate check unavailable");
                self.dependency_failure()
            }
        }
    }

    /// Resolution sits on the request's critical path, so it gets the same
    /// timeout bound as every store operation.
    async fn resolve_identity(&self, credential: &str) -> Result<Option<String>> {
        match tokio::time::timeout(self.resolver_timeout, self.resolver.resolve(credential)).await
        {
            Ok(resolved) => resolved,
            Err(_) => Err(TollgateError::StoreUnavailable(format!(
                "identity resolution exceeded {}ms",
                self.resolver_timeout.as_millis()
            ))),
        }
    }

    fn dependency_failure(&self) -> AdmissionDecision {
        match self.fail_policy {
            FailPolicy::Open => AdmissionDecision::Forward,
            FailPolicy::Closed => AdmissionDecision::reject(503, "admission_unavailable"),
        }
    }
}
