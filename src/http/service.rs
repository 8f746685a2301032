//! HTTP check service.
//!
//! Exposes the limiter registry to callers that cannot embed the
//! middleware: a `check` endpoint that consumes quota, a read-only `status`
//! endpoint and an administrative `reset`.
//!
//! The service does no authentication. `reset` lets any caller that reaches
//! the listener clear a counter, so it is only mounted when
//! `server.enable_admin_routes` is set, and such a listener must only be
//! reachable from trusted operators.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::identity::resolve_identity;
use super::middleware::apply_headers;
use crate::error::TurnstileError;
use crate::ratelimit::{Decision, LimiterRegistry};

/// Shared state of the check service.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<LimiterRegistry>,
    pub trust_forwarded: bool,
    /// Whether the unauthenticated reset route is mounted
    pub admin_routes: bool,
}

/// Body of `POST /v1/check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub identity: String,
    pub operation: String,
}

/// Error wrapper mapping crate errors onto HTTP statuses.
pub struct ApiError(TurnstileError);

impl From<TurnstileError> for ApiError {
    fn from(error: TurnstileError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TurnstileError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            TurnstileError::UnknownOperation(_) => StatusCode::NOT_FOUND,
            TurnstileError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            TurnstileError::Config(_) | TurnstileError::Io(_) => {
                error!(error = %self.0, "Internal error while serving request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/v1/check", post(check))
        .route("/v1/status/{operation}", get(status));

    if state.admin_routes {
        router = router.route("/v1/limits/{operation}/{identity}", delete(reset));
    }

    router.with_state(state)
}

fn decision_response(decision: Decision) -> Response {
    let status = if decision.admitted {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };

    let mut response = (status, Json(decision)).into_response();
    apply_headers(response.headers_mut(), &decision);
    response
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "operations": state.registry.operations(),
    }))
}

/// Decide whether a request should be admitted, consuming quota.
#[instrument(skip_all)]
async fn check(
    State(state): State<AppState>,
    Json(request): Json<CheckRequest>,
) -> Result<Response, ApiError> {
    let identity = request.identity.trim();
    let operation = request.operation.trim();

    if identity.is_empty() || operation.is_empty() {
        warn!("Received check request with empty identity or operation");
        return Err(TurnstileError::InvalidKey(
            "identity and operation are required".to_string(),
        )
        .into());
    }

    let decision = state.registry.check(identity, operation).await?;

    debug!(
        identity = %identity,
        operation = %operation,
        admitted = decision.admitted,
        remaining = decision.remaining,
        "Rate limit decision made"
    );

    Ok(decision_response(decision))
}

/// Report the caller's own status for an operation without consuming quota.
async fn status(
    State(state): State<AppState>,
    Path(operation): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identity = resolve_identity(request.headers(), remote, state.trust_forwarded);

    let decision = state.registry.status(&identity, &operation).await?;

    let mut response = Json(serde_json::json!({
        "identity": identity,
        "operation": operation,
        "decision": decision,
    }))
    .into_response();
    apply_headers(response.headers_mut(), &decision);
    Ok(response)
}

/// Forget the counter for one caller.
async fn reset(
    State(state): State<AppState>,
    Path((operation, identity)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state.registry.reset(&identity, &operation).await?;
    info!(operation = %operation, identity = %identity, removed = removed, "Counter reset requested");

    Ok(Json(serde_json::json!({ "removed": removed })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{FailurePolicy, LimitRule, ManualClock, RateLimitKey, RateLimitRecord};
    use crate::store::{CounterStore, MemoryStore, StoreError, StoreResult};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    /// A store whose every operation fails.
    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn get(&self, _key: &RateLimitKey) -> StoreResult<Option<RateLimitRecord>> {
            Err(StoreError::Unavailable("down".to_string()))
        }

        async fn update(
            &self,
            _key: &RateLimitKey,
            _apply: &mut (dyn FnMut(Option<RateLimitRecord>) -> Option<RateLimitRecord> + Send),
        ) -> StoreResult<()> {
            Err(StoreError::Unavailable("down".to_string()))
        }

        async fn remove(&self, _key: &RateLimitKey) -> StoreResult<bool> {
            Err(StoreError::Unavailable("down".to_string()))
        }

        async fn purge_stale(&self, _operation: &str, _cutoff: i64) -> StoreResult<usize> {
            Err(StoreError::Unavailable("down".to_string()))
        }

        async fn len(&self) -> StoreResult<usize> {
            Err(StoreError::Unavailable("down".to_string()))
        }
    }

    fn app_with(store: Arc<dyn CounterStore>, admin_routes: bool) -> Router {
        let registry = LimiterRegistry::from_rules(
            &[LimitRule::new("auth", 3, 60), LimitRule::new("api", 3, 60)],
            store,
            Arc::new(ManualClock::new(0)),
            FailurePolicy::Open,
            0,
        )
        .unwrap();

        router(AppState {
            registry: Arc::new(registry),
            trust_forwarded: true,
            admin_routes,
        })
    }

    fn create_app() -> Router {
        app_with(Arc::new(MemoryStore::new()), true)
    }

    fn reset_request(operation: &str, identity: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("DELETE")
            .uri(format!("/v1/limits/{}/{}", operation, identity))
            .body(Body::empty())
            .unwrap()
    }

    fn check_request(identity: &str, operation: &str) -> HttpRequest<Body> {
        let body = serde_json::json!({ "identity": identity, "operation": operation });
        HttpRequest::builder()
            .method("POST")
            .uri("/v1/check")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_app();
        let request = HttpRequest::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["operations"], serde_json::json!(["api", "auth"]));
    }

    #[tokio::test]
    async fn test_check_until_rejected() {
        let app = create_app();

        for expected in [2, 1, 0] {
            let response = app.clone().oneshot(check_request("1.2.3.4", "auth")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let json = body_json(response).await;
            assert_eq!(json["admitted"], true);
            assert_eq!(json["remaining"], expected);
        }

        let response = app.clone().oneshot(check_request("1.2.3.4", "auth")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "60");
        let json = body_json(response).await;
        assert_eq!(json["admitted"], false);
        assert_eq!(json["retry_after_seconds"], 60);

        // Same identity, different operation.
        let response = app.oneshot(check_request("1.2.3.4", "api")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_check_empty_identity_is_bad_request() {
        let app = create_app();

        let response = app.oneshot(check_request("", "auth")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_check_unknown_operation_is_not_found() {
        let app = create_app();

        let response = app.oneshot(check_request("1.2.3.4", "upload")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_is_read_only() {
        let app = create_app();
        app.clone().oneshot(check_request("9.9.9.9", "api")).await.unwrap();

        for _ in 0..3 {
            let request = HttpRequest::builder()
                .uri("/v1/status/api")
                .header("x-forwarded-for", "9.9.9.9")
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["x-ratelimit-remaining"], "2");

            let json = body_json(response).await;
            assert_eq!(json["identity"], "9.9.9.9");
            assert_eq!(json["decision"]["remaining"], 2);
        }
    }

    #[tokio::test]
    async fn test_reset_restores_quota() {
        let app = create_app();
        for _ in 0..4 {
            app.clone().oneshot(check_request("1.2.3.4", "auth")).await.unwrap();
        }

        let response = app.clone().oneshot(reset_request("auth", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["removed"], true);

        let response = app.oneshot(check_request("1.2.3.4", "auth")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_check_trims_operation() {
        let app = create_app();

        let response = app.oneshot(check_request(" 1.2.3.4 ", " auth")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["remaining"], 2);
    }

    #[tokio::test]
    async fn test_reset_not_mounted_by_default() {
        let app = app_with(Arc::new(MemoryStore::new()), false);
        for _ in 0..4 {
            app.clone().oneshot(check_request("1.2.3.4", "auth")).await.unwrap();
        }

        let response = app.clone().oneshot(reset_request("auth", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // The counter was left alone.
        let response = app.oneshot(check_request("1.2.3.4", "auth")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_storage_error_is_service_unavailable() {
        let app = app_with(Arc::new(DownStore), true);

        let response = app.clone().oneshot(reset_request("auth", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("down"));

        // Checks degrade through the failure policy instead.
        let response = app.oneshot(check_request("1.2.3.4", "auth")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
