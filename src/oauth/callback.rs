//! OAuth Callback Server
//!
//! A transient HTTP listener that receives the provider's redirect after the
//! user authorizes in the browser. The first callback is captured into a
//! single-slot cell; every later callback is answered with the same static
//! page and otherwise ignored.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{RawQuery, State},
    response::Html,
    routing::get,
};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::{Error, Result};

/// Path the provider redirects to
pub const CALLBACK_PATH: &str = "/callback";

/// How long a stopping listener may drain before it is aborted
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const CALLBACK_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Conduit</title></head>
<body style="font-family: sans-serif; text-align: center; padding-top: 4rem;">
    <h1>Authorization received</h1>
    <p>You can close this window and return to your terminal.</p>
</body>
</html>"#;

/// Query parameters of the provider redirect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,
    /// State round-tripped from the authorize request
    pub state: Option<String>,
    /// Error code
    pub error: Option<String>,
    /// Error description
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Parse a redirect query. `None` when a known parameter repeats.
    #[must_use]
    pub fn from_query(query: &str) -> Option<Self> {
        let mut params = Self::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            let field = match key.as_ref() {
                "code" => &mut params.code,
                "state" => &mut params.state,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                _ => continue,
            };
            if field.replace(value.into_owned()).is_some() {
                return None;
            }
        }
        Some(params)
    }

    /// Error outcome for a redirect whose query could not be trusted
    fn malformed() -> Self {
        Self {
            error: Some("invalid_request".to_string()),
            error_description: Some("malformed callback query".to_string()),
            ..Self::default()
        }
    }
}

/// Single-slot result cell. The atomic claim decides the winner; the mutex
/// only hands the sender to it.
struct CallbackSlot {
    claimed: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<CallbackParams>>>,
}

impl CallbackSlot {
    fn deliver(&self, params: CallbackParams) -> bool {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.tx
            .lock()
            .take()
            .is_some_and(|tx| tx.send(params).is_ok())
    }
}

/// A running callback listener
pub struct CallbackServer {
    addr: SocketAddr,
    rx: Option<oneshot::Receiver<CallbackParams>>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CallbackServer {
    /// Bind the preferred port, then each fallback port, then an ephemeral
    /// port, and start serving the callback route.
    pub async fn start(preferred: Option<u16>, fallback: &[u16]) -> Result<Self> {
        let listener = bind_first_available(preferred, fallback).await?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Internal(format!("Failed to get callback server address: {e}")))?;

        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(CallbackSlot {
            claimed: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
        });

        let app = Router::new()
            .route(CALLBACK_PATH, get(handle_callback))
            .with_state(slot);

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone().cancelled_owned();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
            {
                warn!(error = %e, "OAuth callback server error");
            }
        });

        info!(addr = %addr, "OAuth callback server listening");

        Ok(Self {
            addr,
            rx: Some(rx),
            shutdown,
            handle: Some(handle),
        })
    }

    /// Bound address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Redirect URI to register with the authorize request
    #[must_use]
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}{CALLBACK_PATH}", self.addr.port())
    }

    /// Wait for the first callback, then stop the listener.
    ///
    /// The listener is stopped on every outcome, including timeout and
    /// cancellation.
    pub async fn wait(mut self, timeout: Duration, cancel: &CancellationToken) -> Result<CallbackParams> {
        let outcome = match self.rx.take() {
            Some(rx) => tokio::select! {
                received = tokio::time::timeout(timeout, rx) => match received {
                    Ok(Ok(params)) => Ok(params),
                    Ok(Err(_)) => Err(Error::Internal("OAuth callback listener stopped".to_string())),
                    Err(_) => Err(Error::CallbackTimeout(timeout.as_secs())),
                },
                () = cancel.cancelled() => Err(Error::Cancelled),
            },
            None => Err(Error::Internal("OAuth callback already consumed".to_string())),
        };

        self.stop().await;
        outcome
    }

    /// Gracefully stop the listener, aborting it after a short grace period
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
            debug!("OAuth callback server did not drain in time, aborting");
            handle.abort();
        }
        debug!(addr = %self.addr, "OAuth callback server stopped");
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn bind_first_available(preferred: Option<u16>, fallback: &[u16]) -> Result<TcpListener> {
    let candidates = preferred.into_iter().chain(fallback.iter().copied());
    for port in candidates {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!(port, error = %e, "Callback port unavailable"),
        }
    }

    TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind callback server: {e}")))
}

async fn handle_callback(
    State(slot): State<Arc<CallbackSlot>>,
    RawQuery(query): RawQuery,
) -> Html<&'static str> {
    let params = CallbackParams::from_query(query.as_deref().unwrap_or_default()).unwrap_or_else(|| {
        warn!("Malformed OAuth callback query");
        CallbackParams::malformed()
    });
    let is_error = params.error.is_some();
    if slot.deliver(params) {
        debug!(is_error, "Received OAuth callback");
    } else {
        debug!("Ignoring OAuth callback after the first");
    }
    Html(CALLBACK_PAGE)
}
