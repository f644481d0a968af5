//! Authentication middleware
//!
//! Gates every non-exempt request on a valid service token. Credential
//! failures collapse into two client-visible outcomes with fixed bodies:
//!
//! - 401 `unauthorized` when no usable credential was presented
//! - 403 `forbidden` when the credential is unknown, revoked or expired
//!
//! The specific reason is only logged, with the token masked.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, error, warn};

use super::websocket::{DeferredRejection, WebSocketAuthenticator, is_websocket_upgrade};
use crate::auth::{AuthInfo, ExtractedToken, TokenSource, TokenValidator, extractor, mask_token};
use crate::config::AuthConfig;
use crate::{Error, Result};

/// `WWW-Authenticate` challenge sent with every 401
pub const AUTH_CHALLENGE: &str = "Bearer realm=\"conduit\"";

/// Details passed to the failure hook
#[derive(Debug)]
pub struct AuthFailure<'a> {
    /// Request path
    pub path: &'a str,
    /// Where the rejected credential came from
    pub source: TokenSource,
    /// Masked form of the credential, empty when none was presented
    pub masked_token: String,
    /// Internal reason
    pub error: &'a Error,
}

/// Callback invoked on every authentication failure
pub type AuthFailureHook = Arc<dyn Fn(&AuthFailure<'_>) + Send + Sync>;

/// Shared state of the authentication middleware
pub struct AuthState {
    enabled: bool,
    exempt_paths: Vec<String>,
    validator: Arc<dyn TokenValidator>,
    websocket: WebSocketAuthenticator,
    on_failure: Option<AuthFailureHook>,
}

impl AuthState {
    /// Create middleware state backed by `validator`
    pub fn new(config: &AuthConfig, validator: Arc<dyn TokenValidator>) -> Self {
        Self {
            enabled: config.enabled,
            exempt_paths: config.exempt_paths.clone(),
            websocket: WebSocketAuthenticator::new(config.websocket_deferred),
            validator,
            on_failure: None,
        }
    }

    /// Install a hook called before every failure response
    #[must_use]
    pub fn with_failure_hook(mut self, hook: AuthFailureHook) -> Self {
        self.on_failure = Some(hook);
        self
    }

    /// Whether authentication is enforced
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Exempt paths match exactly or as a `/`-separated prefix
    #[must_use]
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|p| {
            path == p
                || path
                    .strip_prefix(p.as_str())
                    .is_some_and(|rest| p.ends_with('/') || rest.starts_with('/'))
        })
    }

    /// Validate an extracted credential into request-scoped identity
    pub async fn authenticate(&self, extracted: &ExtractedToken) -> Result<AuthInfo> {
        if extracted.is_malformed {
            return Err(Error::MalformedCredential);
        }
        if !extracted.is_present() {
            return Err(Error::MissingCredential);
        }

        let token = self.validator.validate_token(&extracted.token).await?;
        Ok(AuthInfo::from_token(token, extracted.source))
    }

    /// Log a failure and run the hook
    pub(crate) fn report_failure(&self, path: &str, extracted: &ExtractedToken, err: &Error) {
        let masked_token = if extracted.token.is_empty() {
            String::new()
        } else {
            mask_token(&extracted.token)
        };

        if err.is_credential_failure() {
            warn!(
                path = %path,
                source = %extracted.source,
                token = %masked_token,
                reason = %err,
                "Authentication failed"
            );
        } else {
            error!(path = %path, error = %err, "Token validation error");
        }

        if let Some(hook) = &self.on_failure {
            hook(&AuthFailure {
                path,
                source: extracted.source,
                masked_token,
                error: err,
            });
        }
    }
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<Arc<AuthState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if !state.enabled {
        return next.run(request).await;
    }

    let path = request.uri().path().to_string();
    if state.is_exempt(&path) {
        debug!(path = %path, "Exempt path, skipping auth");
        return next.run(request).await;
    }

    // Upgrade handling only applies to WebSocket endpoints
    let upgrade = state.websocket.handles(&path) && is_websocket_upgrade(request.headers());
    let extracted = if upgrade {
        state.websocket.extract(request.headers(), request.uri())
    } else {
        extractor::extract_http(request.headers(), request.uri())
    };

    match state.authenticate(&extracted).await {
        Ok(info) => {
            debug!(path = %path, client = %info.client_name, source = %info.source, "Authenticated request");
            request.extensions_mut().insert(info);
            next.run(request).await
        }
        Err(err) => {
            state.report_failure(&path, &extracted, &err);
            if upgrade && state.websocket.is_deferred() {
                if let Some(code) = WebSocketAuthenticator::close_code(&err) {
                    request.extensions_mut().insert(DeferredRejection { close_code: code });
                    return next.run(request).await;
                }
            }
            rejection_response(&err)
        }
    }
}

/// HTTP response for a failed authentication
#[must_use]
pub fn rejection_response(err: &Error) -> Response {
    let mut response = match err {
        Error::MissingCredential | Error::MalformedCredential => {
            let mut response = (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "unauthorized",
                    "message": "Authentication required"
                })),
            )
                .into_response();
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(AUTH_CHALLENGE),
            );
            response
        }
        Error::InvalidCredential | Error::ExpiredCredential => (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "forbidden",
                "message": "Access denied"
            })),
        )
            .into_response(),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "internal_error",
                "message": "Internal server error"
            })),
        )
            .into_response(),
    };

    response.headers_mut().insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::auth::AuthToken;

    struct RejectAll;

    #[async_trait]
    impl TokenValidator for RejectAll {
        async fn validate_token(&self, _raw: &str) -> Result<AuthToken> {
            Err(Error::InvalidCredential)
        }
    }

    fn state(exempt: &[&str]) -> AuthState {
        let config = AuthConfig {
            exempt_paths: exempt.iter().map(ToString::to_string).collect(),
            ..AuthConfig::default()
        };
        AuthState::new(&config, Arc::new(RejectAll))
    }

    #[test]
    fn exempt_paths_match_on_segment_boundary() {
        let s = state(&["/health", "/public/"]);
        assert!(s.is_exempt("/health"));
        assert!(s.is_exempt("/health/live"));
        assert!(!s.is_exempt("/healthz"));
        assert!(s.is_exempt("/public/docs"));
        assert!(!s.is_exempt("/api/whoami"));
    }

    #[tokio::test]
    async fn missing_and_malformed_are_distinguished_internally() {
        let s = state(&[]);
        let absent = extractor::extract_http(&axum::http::HeaderMap::new(), &"/".parse().unwrap());
        assert!(matches!(s.authenticate(&absent).await, Err(Error::MissingCredential)));

        let mut headers = axum::http::HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        let malformed = extractor::extract_http(&headers, &"/".parse().unwrap());
        assert!(matches!(s.authenticate(&malformed).await, Err(Error::MalformedCredential)));
    }

    #[tokio::test]
    async fn failure_hook_sees_masked_token() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let s = state(&[]).with_failure_hook(Arc::new(move |failure: &AuthFailure<'_>| {
            assert_eq!(failure.masked_token, "cdt_********");
            assert_eq!(failure.source, TokenSource::ApiKeyHeader);
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("cdt_0123456789abcdef"));
        let extracted = extractor::extract_http(&headers, &"/".parse().unwrap());
        let err = s.authenticate(&extracted).await.unwrap_err();
        s.report_failure("/api", &extracted, &err);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejection_bodies_are_generic() {
        let unauthorized = rejection_response(&Error::MalformedCredential);
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            unauthorized.headers()[header::WWW_AUTHENTICATE],
            AUTH_CHALLENGE
        );
        assert_eq!(unauthorized.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");

        let expired = rejection_response(&Error::ExpiredCredential);
        let invalid = rejection_response(&Error::InvalidCredential);
        assert_eq!(expired.status(), StatusCode::FORBIDDEN);
        assert_eq!(invalid.status(), StatusCode::FORBIDDEN);
        assert_eq!(expired.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    }
}
