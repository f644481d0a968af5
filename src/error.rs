//! Error types for Conduit

use std::io;

use thiserror::Error;

/// Result type alias for Conduit
pub type Result<T> = std::result::Result<T, Error>;

/// Conduit errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No credential was presented
    #[error("Authentication required")]
    MissingCredential,

    /// A credential marker was present but carried no usable value
    #[error("Malformed credential")]
    MalformedCredential,

    /// The presented credential is unknown or revoked
    #[error("invalid token")]
    InvalidCredential,

    /// The presented credential is past its expiry
    #[error("token has expired")]
    ExpiredCredential,

    /// The OAuth callback carried a state that does not match this flow
    #[error("OAuth state mismatch - possible CSRF attack")]
    CsrfStateMismatch,

    /// No OAuth callback arrived before the deadline
    #[error("Timed out waiting for OAuth callback after {0}s")]
    CallbackTimeout(u64),

    /// The caller cancelled an in-flight operation
    #[error("Operation cancelled")]
    Cancelled,

    /// The provider redirected back with an error
    #[error("OAuth error: {error} - {description}")]
    OAuthProvider {
        /// Provider error code
        error: String,
        /// Provider error description
        description: String,
    },

    /// Transport-level failure talking to the upstream provider
    #[error("Transport error: {0}")]
    Transport(String),

    /// The upstream token endpoint rejected the exchange
    #[error("Token exchange failed{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    UpstreamExchange {
        /// HTTP status, when a response was received
        status: Option<u16>,
        /// Failure detail
        message: String,
    },

    /// Request rejected by the rate limiter
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until a request would be admitted
        retry_after_secs: u64,
    },

    /// Referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller input failed validation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Persistence failure that is not an IO or database error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether an upstream OAuth call failing with this error may be retried.
    ///
    /// Only transport failures and 5xx responses qualify.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::UpstreamExchange { status: Some(s), .. } => *s >= 500,
            _ => false,
        }
    }

    /// Whether this error belongs to the credential failure family.
    #[must_use]
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            Self::MissingCredential
                | Self::MalformedCredential
                | Self::InvalidCredential
                | Self::ExpiredCredential
        )
    }
}
