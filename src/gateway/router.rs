//! HTTP router and handlers

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Extension, Json, Router,
    extract::State,
    middleware,
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::auth::{AuthState, auth_middleware};
use super::rate_limit::{RateLimitState, rate_limit_middleware};
use super::websocket::{WS_PATH, ws_handler};
use crate::auth::AuthInfo;

/// Shared application state
pub struct AppState {
    /// Authentication middleware state
    pub auth: Arc<AuthState>,
    /// Rate limiters
    pub limits: Arc<RateLimitState>,
    /// Process start, for uptime reporting
    pub started_at: Instant,
}

/// Create the router.
///
/// Layer order, outermost first: tracing, panic catching, authentication,
/// rate limiting. Rate limiting therefore sees the identity established by
/// authentication.
pub fn create_router(state: Arc<AppState>) -> Router {
    let auth = Arc::clone(&state.auth);
    let limits = Arc::clone(&state.limits);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/whoami", get(whoami_handler))
        .route(WS_PATH, get(ws_handler))
        .layer(middleware::from_fn_with_state(limits, rate_limit_middleware))
        .layer(middleware::from_fn_with_state(auth, auth_middleware))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /health`
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

/// `GET /api/whoami` - identity attached by the auth middleware
async fn whoami_handler(auth: Option<Extension<AuthInfo>>) -> impl IntoResponse {
    match auth {
        Some(Extension(info)) => Json(json!({
            "authenticated": true,
            "token_id": info.token_id,
            "client_name": info.client_name,
            "expires_at": info.expires_at,
            "metadata": info.metadata,
            "source": info.source,
            "authenticated_at": info.authenticated_at,
        })),
        None => Json(json!({ "authenticated": false })),
    }
}
