//! Axum middleware that gates a route group behind a rate limiter.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
    Json, Router,
};
use tracing::{debug, warn};

use super::identity::resolve_identity;
use crate::ratelimit::{Decision, RateLimiter};

/// State bound to one protected route group.
#[derive(Clone)]
pub struct RateLimitLayerState {
    limiter: Arc<RateLimiter>,
    trust_forwarded: bool,
}

impl RateLimitLayerState {
    pub fn new(limiter: Arc<RateLimiter>, trust_forwarded: bool) -> Self {
        Self {
            limiter,
            trust_forwarded,
        }
    }
}

/// Wrap every route of `router` with [`enforce`].
pub fn protect<S>(router: Router<S>, state: RateLimitLayerState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(from_fn_with_state(state, enforce))
}

/// Admit or reject a request before it reaches the handler.
///
/// Rejections become `429 Too Many Requests`; admitted responses carry the
/// `X-RateLimit-*` headers.
pub async fn enforce(
    State(state): State<RateLimitLayerState>,
    request: Request,
    next: Next,
) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identity = resolve_identity(request.headers(), remote, state.trust_forwarded);

    let decision = match state.limiter.check_identity(&identity).await {
        Ok(decision) => decision,
        Err(e) => {
            warn!(identity = %identity, error = %e, "Rate limit check failed, passing request through");
            return next.run(request).await;
        }
    };

    if !decision.admitted {
        debug!(
            identity = %identity,
            operation = %state.limiter.operation(),
            "Request rejected by rate limiter"
        );
        return too_many_requests(&decision);
    }

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &decision);
    response
}

/// Copy a decision's advisory headers onto a response.
pub fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    for (name, value) in decision.headers() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

/// The 429 response for a rejected request.
pub fn too_many_requests(decision: &Decision) -> Response {
    let body = serde_json::json!({
        "error": "rate_limit_exceeded",
        "message": "Too many requests. Please wait before trying again.",
        "retry_after": decision.retry_after_seconds.unwrap_or(0),
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    apply_headers(response.headers_mut(), decision);
    response
}
