//! Credential extraction from inbound requests.
//!
//! Sources are tried in a fixed order and extraction stops at the first
//! source that yields either a token or a malformed marker:
//!
//! 1. `Authorization: Bearer <token>`
//! 2. `X-API-Key: <token>`
//! 3. `Sec-WebSocket-Protocol: conduit-auth, <token>` (upgrade requests only)
//! 4. `?token=<token>`

use axum::http::{HeaderMap, Uri, header};
use serde::{Deserialize, Serialize};

/// Subprotocol marker announcing that the next offered protocol is a token
pub const WS_AUTH_PROTOCOL: &str = "conduit-auth";

const API_KEY_HEADER: &str = "x-api-key";
const TOKEN_QUERY_PARAM: &str = "token";

/// Where a credential was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    /// Nothing found
    None,
    /// `Authorization: Bearer`
    BearerHeader,
    /// `X-API-Key`
    ApiKeyHeader,
    /// `token` query parameter
    QueryParam,
    /// `Sec-WebSocket-Protocol` subprotocol list
    #[serde(rename = "websocket_protocol")]
    WebSocketProtocol,
}

impl std::fmt::Display for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::BearerHeader => "bearer_header",
            Self::ApiKeyHeader => "api_key_header",
            Self::QueryParam => "query_param",
            Self::WebSocketProtocol => "websocket_protocol",
        };
        f.write_str(s)
    }
}

/// Outcome of credential extraction. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedToken {
    /// Trimmed token value, empty when absent or malformed
    pub token: String,
    /// Source that produced this result
    pub source: TokenSource,
    /// The source's marker was present without a usable value
    pub is_malformed: bool,
}

impl ExtractedToken {
    fn absent() -> Self {
        Self {
            token: String::new(),
            source: TokenSource::None,
            is_malformed: false,
        }
    }

    fn malformed(source: TokenSource) -> Self {
        Self {
            token: String::new(),
            source,
            is_malformed: true,
        }
    }

    fn present(token: &str, source: TokenSource) -> Self {
        Self {
            token: token.to_string(),
            source,
            is_malformed: false,
        }
    }

    /// A usable token was found
    #[must_use]
    pub fn is_present(&self) -> bool {
        !self.token.is_empty() && !self.is_malformed
    }

    /// This source signalled intent, so lower-priority sources are skipped
    fn is_decisive(&self) -> bool {
        self.is_malformed || !self.token.is_empty()
    }
}

/// Extract a credential from a plain HTTP request
#[must_use]
pub fn extract_http(headers: &HeaderMap, uri: &Uri) -> ExtractedToken {
    let sources: [&dyn Fn() -> ExtractedToken; 3] = [
        &|| from_bearer(headers),
        &|| from_api_key(headers),
        &|| from_query(uri),
    ];
    first_decisive(&sources)
}

/// Extract a credential from a WebSocket upgrade request
#[must_use]
pub fn extract_websocket(headers: &HeaderMap, uri: &Uri) -> ExtractedToken {
    let sources: [&dyn Fn() -> ExtractedToken; 4] = [
        &|| from_bearer(headers),
        &|| from_api_key(headers),
        &|| from_subprotocol(headers),
        &|| from_query(uri),
    ];
    first_decisive(&sources)
}

fn first_decisive(sources: &[&dyn Fn() -> ExtractedToken]) -> ExtractedToken {
    sources
        .iter()
        .map(|source| source())
        .find(ExtractedToken::is_decisive)
        .unwrap_or_else(ExtractedToken::absent)
}

/// `Authorization: Bearer <token>`; scheme match is case-insensitive (RFC 7235)
fn from_bearer(headers: &HeaderMap) -> ExtractedToken {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return ExtractedToken::absent();
    };

    let value = value.trim();
    let Some(scheme) = value.get(..6) else {
        return ExtractedToken::absent();
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return ExtractedToken::absent();
    }

    let rest = &value[6..];
    // "Bearerxyz" is a different scheme, not a bearer token
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return ExtractedToken::absent();
    }

    match rest.trim() {
        "" => ExtractedToken::malformed(TokenSource::BearerHeader),
        token => ExtractedToken::present(token, TokenSource::BearerHeader),
    }
}

fn from_api_key(headers: &HeaderMap) -> ExtractedToken {
    match headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        Some(value) => match value.trim() {
            "" => ExtractedToken::absent(),
            token => ExtractedToken::present(token, TokenSource::ApiKeyHeader),
        },
        None => ExtractedToken::absent(),
    }
}

/// `conduit-auth` followed by the token in the offered subprotocol list
fn from_subprotocol(headers: &HeaderMap) -> ExtractedToken {
    let offered: Vec<&str> = headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .collect();

    let Some(pos) = offered.iter().position(|p| *p == WS_AUTH_PROTOCOL) else {
        return ExtractedToken::absent();
    };

    match offered.get(pos + 1) {
        Some(token) if !token.is_empty() => {
            ExtractedToken::present(token, TokenSource::WebSocketProtocol)
        }
        _ => ExtractedToken::malformed(TokenSource::WebSocketProtocol),
    }
}

fn from_query(uri: &Uri) -> ExtractedToken {
    let Some(query) = uri.query() else {
        return ExtractedToken::absent();
    };

    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == TOKEN_QUERY_PARAM)
        .map_or_else(ExtractedToken::absent, |(_, v)| match v.trim() {
            "" => ExtractedToken::absent(),
            token => ExtractedToken::present(token, TokenSource::QueryParam),
        })
}
