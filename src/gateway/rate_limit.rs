//! Rate-limit middleware
//!
//! Runs after authentication. Requests carrying [`AuthInfo`] are counted per
//! client name on the authenticated limiter; everything else is counted per
//! client IP on the anonymous limiter.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::warn;

use crate::Error;
use crate::auth::AuthInfo;
use crate::config::RateLimitConfig;
use crate::failsafe::{RateLimitDecision, RateLimiter, spawn_sweeper};

const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Anonymous and authenticated limiters
pub struct RateLimitState {
    /// Keyed by client IP
    pub anonymous: Arc<RateLimiter>,
    /// Keyed by client name
    pub authenticated: Arc<RateLimiter>,
}

impl RateLimitState {
    /// Build both limiters from configuration
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            anonymous: Arc::new(RateLimiter::new(&config.anonymous)),
            authenticated: Arc::new(RateLimiter::new(&config.authenticated)),
        }
    }

    /// Start the background sweeps; they stop when `shutdown` fires
    pub fn spawn_sweepers(&self, shutdown: &tokio::sync::broadcast::Sender<()>) {
        spawn_sweeper("anonymous", Arc::clone(&self.anonymous), shutdown.subscribe());
        spawn_sweeper("authenticated", Arc::clone(&self.authenticated), shutdown.subscribe());
    }
}

/// Rate-limit middleware
pub async fn rate_limit_middleware(
    State(state): State<Arc<RateLimitState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (limiter, key, log_id) = match request.extensions().get::<AuthInfo>() {
        Some(info) => (
            &state.authenticated,
            info.client_name.clone(),
            info.client_name.clone(),
        ),
        None => {
            let ip = client_ip(&request);
            let masked = scrub_ip(&ip);
            (&state.anonymous, ip, masked)
        }
    };

    let Some(decision) = limiter.allow(&key) else {
        return next.run(request).await;
    };

    if !decision.allowed {
        let err = Error::RateLimited {
            retry_after_secs: decision.retry_after_secs(),
        };
        warn!(
            identifier = %log_id,
            path = %request.uri().path(),
            reason = %err,
            "Rate limit exceeded"
        );
        return rate_limited_response(&err, &decision);
    }

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &decision);
    response
}

/// First `X-Forwarded-For` entry, else `X-Real-IP`, else the socket address
#[must_use]
pub fn client_ip<B>(request: &Request<B>) -> String {
    let headers = request.headers();

    if let Some(first) = header_str(headers, X_FORWARDED_FOR)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }

    if let Some(real) = header_str(headers, X_REAL_IP)
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return real.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |ConnectInfo(addr)| addr.ip().to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Partially masked IP for logs. Never used as a limiter key.
#[must_use]
pub fn scrub_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let [a, b, c, _] = v4.octets();
            format!("{a}.{b}.{c}.x")
        }
        Ok(IpAddr::V6(v6)) => {
            let s = v6.segments();
            format!("{:x}:{:x}:{:x}::x", s[0], s[1], s[2])
        }
        Err(_) => "redacted".to_string(),
    }
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_unix()));
}

fn rate_limited_response(err: &Error, decision: &RateLimitDecision) -> Response {
    let retry_after = decision.retry_after_secs();
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "rate_limit_exceeded",
            "message": err.to_string(),
            "retry_after": retry_after,
        })),
    )
        .into_response();

    let headers = response.headers_mut();
    apply_headers(headers, decision);
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}
