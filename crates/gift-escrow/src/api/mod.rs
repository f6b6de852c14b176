//! HTTP API for senders, recipients and operators.

mod handlers;
mod middleware;
mod types;

pub use handlers::*;
pub use middleware::{
    logging_middleware, rate_limit_middleware, trace_layer, Caller, Operator, RateLimitState,
};
pub use types::*;

use crate::claim::ClaimVerifier;
use crate::identity::IdentityProvider;
use crate::machine::FulfillmentMachine;
use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use secrecy::SecretString;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub machine: Arc<FulfillmentMachine>,
    pub claims: Arc<ClaimVerifier>,
    pub identity: Arc<dyn IdentityProvider>,
    /// Bearer token for operator endpoints; operator routes are closed without one.
    pub operator_token: Option<Arc<SecretString>>,
}

impl AppState {
    pub fn new(
        machine: Arc<FulfillmentMachine>,
        claims: Arc<ClaimVerifier>,
        identity: Arc<dyn IdentityProvider>,
        operator_token: Option<SecretString>,
    ) -> Self {
        Self {
            machine,
            claims,
            identity,
            operator_token: operator_token.map(Arc::new),
        }
    }
}

/// Create the API router; claims are limited to `claims_per_minute`.
pub fn create_router(state: AppState, claims_per_minute: u32) -> Router {
    create_router_with_rate_limit(state, RateLimitState::new(claims_per_minute))
}

/// Create the API router with a custom claim rate limiter.
pub fn create_router_with_rate_limit(state: AppState, rate_limit: RateLimitState) -> Router {
    let claims = Router::new()
        .route("/v1/claims/:token", post(handlers::claim_gift))
        .route_layer(axum_middleware::from_fn_with_state(
            rate_limit,
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/quote", post(handlers::quote))
        .route("/v1/gifts", post(handlers::create_gift))
        .route("/v1/gifts/:id", get(handlers::get_gift))
        .route("/v1/gifts/:id/swaps", get(handlers::pending_swaps))
        .route("/v1/gifts/:id/swaps/:leg/confirm", post(handlers::confirm_swap))
        .route("/v1/gifts/:id/escrow", get(handlers::pending_escrow))
        .route("/v1/gifts/:id/escrow/:leg/confirm", post(handlers::confirm_escrow))
        .route("/v1/gifts/:id/cancel", post(handlers::cancel_gift))
        .route("/v1/credits", post(handlers::grant_credit))
        .merge(claims)
        .layer(axum_middleware::from_fn(logging_middleware))
        .layer(trace_layer())
        .with_state(state)
}
