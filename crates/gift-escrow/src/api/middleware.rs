//! Rate limiting, authentication and logging middleware.

use super::AppState;
use crate::error::GiftError;
use crate::identity::AuthenticatedIdentity;
use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{num::NonZeroU32, sync::Arc};
use subtle::ConstantTimeEq;
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    trace::TraceLayer,
};
use tracing::{debug, info_span, warn, Span};

/// Global rate limiter (not keyed by IP).
pub type GlobalLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiter for claim attempts, shared across requests.
#[derive(Clone)]
pub struct RateLimitState {
    pub global: Arc<GlobalLimiter>,
}

impl RateLimitState {
    pub fn new(requests_per_minute: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN));

        Self {
            global: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Create a permissive rate limiter for testing.
    pub fn permissive() -> Self {
        Self::new(1000)
    }
}

/// Returns 429 once the claim quota is spent.
pub async fn rate_limit_middleware(
    State(rate_limit): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Result<Response, GiftError> {
    if rate_limit.global.check().is_err() {
        warn!("Claim rate limit exceeded");
        return Err(GiftError::RateLimited);
    }

    Ok(next.run(request).await)
}

/// Logging middleware for requests. Claim paths are logged without the token.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = redact_path(request.uri().path());
    let start = std::time::Instant::now();

    debug!(%method, %path, "Request started");

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();

    if status.is_success() {
        debug!(%method, %path, %status, ?duration, "Request completed");
    } else {
        warn!(%method, %path, %status, ?duration, "Request failed");
    }

    response
}

/// HTTP trace layer whose spans carry the redacted path, never the URI.
pub fn trace_layer(
) -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, fn(&Request<Body>) -> Span> {
    TraceLayer::new_for_http().make_span_with(request_span as fn(&Request<Body>) -> Span)
}

fn request_span(request: &Request<Body>) -> Span {
    info_span!(
        "request",
        method = %request.method(),
        path = %redact_path(request.uri().path()),
    )
}

fn redact_path(path: &str) -> String {
    match path.strip_prefix("/v1/claims/") {
        Some(_) => "/v1/claims/[REDACTED]".to_string(),
        None => path.to_string(),
    }
}

/// `Authorization: Bearer <token>` value.
pub(crate) fn bearer_token(parts: &Parts) -> Result<&str, GiftError> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| GiftError::Unauthorized("Missing bearer token".to_string()))
}

/// Caller identity, resolved through the identity provider.
pub struct Caller(pub AuthenticatedIdentity);

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = GiftError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let identity = state.identity.authenticate(token).await?;
        Ok(Caller(identity))
    }
}

/// Caller holding the operator token.
pub struct Operator;

#[async_trait]
impl FromRequestParts<AppState> for Operator {
    type Rejection = GiftError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        use secrecy::ExposeSecret;

        let expected = state
            .operator_token
            .as_ref()
            .ok_or(GiftError::Forbidden)?;
        let token = bearer_token(parts)?;

        if !token_matches(token, expected.expose_secret()) {
            return Err(GiftError::Forbidden);
        }
        Ok(Operator)
    }
}

fn token_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}
