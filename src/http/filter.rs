//! Axum middleware adapter for the admission stage.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use url::form_urlencoded;

use crate::admission::{AdmissionDecision, AdmissionRequest, Gatekeeper};

/// Query parameter carrying the access credential.
pub const CREDENTIAL_PARAM: &str = "accessToken";
/// Header carrying the access credential; takes precedence over the query
/// parameter.
pub const CREDENTIAL_HEADER: &str = "x-access-token";

/// Pre-routing middleware: runs the admission check and either passes the
/// request through unchanged or short-circuits with the rejection response.
///
/// Mount this layer ahead of every handler that consumes backend quota.
pub async fn admission_filter(
    State(gatekeeper): State<Arc<Gatekeeper>>,
    request: Request,
    next: Next,
) -> Response {
    let admission = AdmissionRequest {
        method: request.method().to_string(),
        uri: request.uri().to_string(),
        credential: extract_credential(&request),
    };

    match gatekeeper.admit(&admission).await {
        AdmissionDecision::Forward => next.run(request).await,
        AdmissionDecision::Reject { status, reason } => rejection_response(status, reason),
    }
}

/// Pull the access credential from the request, header first, then the
/// query string. Query values are form-decoded, so percent-encoded tokens
/// compare equal to what the resolver holds. Empty values count as absent.
fn extract_credential(request: &Request) -> Option<String> {
    if let Some(value) = request
        .headers()
        .get(CREDENTIAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return Some(value.to_string());
    }

    request.uri().query().and_then(|query| {
        form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == CREDENTIAL_PARAM)
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
    })
}

fn rejection_response(status: u16, reason: &'static str) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": reason }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::TokenBucketLimiter;
    use crate::config::{AdmissionConfig, RateLimitConfig};
    use crate::resolver::StaticTokenResolver;
    use crate::store::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn test_router(capacity: u64) -> Router {
        let resolver = Arc::new(StaticTokenResolver::new(HashMap::from([
            ("valid-token".to_string(), "user-1".to_string()),
            ("team/42".to_string(), "user-2".to_string()),
        ])));
        let rate_limit = RateLimitConfig {
            capacity,
            refill_interval_ms: 60_000,
            bucket_ttl_ms: None,
        };
        let admission = AdmissionConfig::default();
        let limiter = TokenBucketLimiter::new(Arc::new(MemoryStore::new()), &rate_limit, &admission);
        let gatekeeper = Arc::new(Gatekeeper::new(resolver, limiter, &admission));

        Router::new()
            .route("/api/heroes", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                gatekeeper,
                admission_filter,
            ))
    }

    async fn send(router: Router, uri: &str, header: Option<&str>) -> (StatusCode, String) {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(value) = header {
            builder = builder.header(CREDENTIAL_HEADER, value);
        }
        let response = router
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn test_missing_credential_returns_401() {
        let (status, body) = send(test_router(5), "/api/heroes", None).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("missing_credential"));
    }

    #[tokio::test]
    async fn test_query_credential_admits() {
        let (status, body) =
            send(test_router(5), "/api/heroes?accessToken=valid-token", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_header_credential_admits() {
        let (status, _) = send(test_router(5), "/api/heroes", Some("valid-token")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_percent_encoded_query_credential_admits() {
        let (status, body) =
            send(test_router(5), "/api/heroes?accessToken=team%2F42", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_unknown_credential_returns_401() {
        let (status, body) = send(test_router(5), "/api/heroes?accessToken=bogus", None).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("unknown_credential"));
    }

    #[tokio::test]
    async fn test_exhausted_bucket_returns_429_with_reason() {
        let router = test_router(1);

        let (status, _) = send(
            router.clone(),
            "/api/heroes?accessToken=valid-token",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(router, "/api/heroes?accessToken=valid-token", None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(body.contains("rate_limited"));
    }

    #[tokio::test]
    async fn test_empty_credential_value_counts_as_missing() {
        let (status, body) = send(test_router(5), "/api/heroes?accessToken=", None).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("missing_credential"));
    }
}
