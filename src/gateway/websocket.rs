//! WebSocket authentication and the `/ws` endpoint
//!
//! Upgrade requests run through the same extraction and validation pipeline
//! as plain HTTP, with the `conduit-auth` subprotocol as an extra source.
//! When that source authenticated the connection the server echoes the
//! marker in its upgrade response.
//!
//! Rejection normally happens before the handshake with the HTTP 401/403
//! responses. In deferred mode the upgrade completes and the socket is then
//! closed with 4401 or 4403.

use axum::{
    Extension,
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    http::{HeaderMap, Uri, header},
    response::Response,
};
use serde_json::json;
use tracing::{debug, info};

use crate::Error;
use crate::auth::{AuthInfo, ExtractedToken, TokenSource, WS_AUTH_PROTOCOL, extractor};

/// Route served by [`ws_handler`]
pub const WS_PATH: &str = "/ws";

/// Close code for a missing or malformed credential
pub const CLOSE_UNAUTHORIZED: u16 = 4401;

/// Close code for an invalid or expired credential
pub const CLOSE_FORBIDDEN: u16 = 4403;

/// Marker left on an upgrade request whose authentication failed in
/// deferred mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredRejection {
    /// Close code to send once the socket is open
    pub close_code: u16,
}

/// Applies the auth pipeline to WebSocket upgrades
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketAuthenticator {
    deferred: bool,
}

impl WebSocketAuthenticator {
    /// `deferred` selects post-handshake rejection
    #[must_use]
    pub fn new(deferred: bool) -> Self {
        Self { deferred }
    }

    /// Whether failures are reported after the upgrade
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    /// Whether `path` is a WebSocket endpoint
    #[must_use]
    pub fn handles(&self, path: &str) -> bool {
        path == WS_PATH
    }

    /// Extract a credential from an upgrade request
    #[must_use]
    pub fn extract(&self, headers: &HeaderMap, uri: &Uri) -> ExtractedToken {
        extractor::extract_websocket(headers, uri)
    }

    /// Close code mirroring the HTTP status for a credential failure
    #[must_use]
    pub fn close_code(err: &Error) -> Option<u16> {
        match err {
            Error::MissingCredential | Error::MalformedCredential => Some(CLOSE_UNAUTHORIZED),
            Error::InvalidCredential | Error::ExpiredCredential => Some(CLOSE_FORBIDDEN),
            _ => None,
        }
    }

    /// Whether the upgrade response must carry `Sec-WebSocket-Protocol: conduit-auth`
    #[must_use]
    pub fn echoes_subprotocol(info: &AuthInfo) -> bool {
        info.source == TokenSource::WebSocketProtocol
    }
}

/// `Connection: upgrade` + `Upgrade: websocket`
#[must_use]
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case("upgrade"));
    upgrade && connection
}

/// `GET /ws`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    auth: Option<Extension<AuthInfo>>,
    rejection: Option<Extension<DeferredRejection>>,
) -> Response {
    if let Some(Extension(rejection)) = rejection {
        return ws.on_upgrade(move |socket| close_with(socket, rejection.close_code));
    }

    let info = auth.map(|Extension(info)| info);
    let ws = match &info {
        Some(info) if WebSocketAuthenticator::echoes_subprotocol(info) => {
            ws.protocols([WS_AUTH_PROTOCOL])
        }
        _ => ws,
    };
    ws.on_upgrade(move |socket| session(socket, info))
}

async fn close_with(mut socket: WebSocket, code: u16) {
    let reason = if code == CLOSE_UNAUTHORIZED {
        "Authentication required"
    } else {
        "Access denied"
    };
    debug!(code, "Closing WebSocket after deferred auth failure");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Greets the client with its identity and echoes text frames
async fn session(mut socket: WebSocket, info: Option<AuthInfo>) {
    let client = info
        .as_ref()
        .map_or_else(|| "anonymous".to_string(), |i| i.client_name.clone());
    info!(client = %client, "WebSocket session opened");

    let hello = json!({
        "type": "authenticated",
        "client_name": client,
        "source": info.as_ref().map_or(TokenSource::None, |i| i.source),
    });
    if socket
        .send(Message::Text(hello.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) => {
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    debug!(client = %client, "WebSocket session closed");
}
