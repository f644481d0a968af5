//! Inbound credential handling
//!
//! - [`extractor`]: pulls a candidate credential out of an HTTP or WebSocket
//!   upgrade request, in fixed priority order
//! - [`store`]: gateway-issued service tokens persisted (hashed) in SQLite
//!
//! The request-scoped [`AuthInfo`] produced by a successful validation is
//! attached to the request by the gateway middleware.

pub mod extractor;
pub mod store;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub use extractor::{ExtractedToken, TokenSource, WS_AUTH_PROTOCOL};
pub use store::{AuthToken, CreateTokenRequest, CreatedToken, ServiceTokenStore, TokenValidator};

/// Identity of an authenticated caller, valid for a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthInfo {
    /// Service token ID
    pub token_id: Uuid,
    /// Client the token was issued to
    pub client_name: String,
    /// Token expiry, if any
    pub expires_at: Option<DateTime<Utc>>,
    /// Free-form metadata stored with the token
    pub metadata: HashMap<String, String>,
    /// Where the credential was found
    pub source: TokenSource,
    /// When this request was authenticated
    pub authenticated_at: DateTime<Utc>,
}

impl AuthInfo {
    /// Build request-scoped identity from a validated token
    #[must_use]
    pub fn from_token(token: AuthToken, source: TokenSource) -> Self {
        Self {
            token_id: token.token_id,
            client_name: token.client_name,
            expires_at: token.expires_at,
            metadata: token.metadata,
            source,
            authenticated_at: Utc::now(),
        }
    }
}

/// SHA-256 of a raw token, lowercase hex
#[must_use]
pub fn hash_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Render a credential for logs. Output is always 12 characters and reveals
/// at most the first four characters of long tokens.
#[must_use]
pub fn mask_token(token: &str) -> String {
    if token.chars().count() < 16 {
        return "*".repeat(12);
    }
    let head: String = token.chars().take(4).collect();
    format!("{head}********")
}
