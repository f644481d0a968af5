//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::auth::AuthState;
use super::rate_limit::RateLimitState;
use super::router::{AppState, create_router};
use crate::auth::{ServiceTokenStore, TokenValidator};
use crate::config::Config;
use crate::{Error, Result};

/// Conduit gateway server
pub struct Gateway {
    config: Config,
    state: Arc<AppState>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl Gateway {
    /// Create a gateway validating against `store`
    #[must_use]
    pub fn new(config: Config, store: ServiceTokenStore) -> Self {
        Self::with_validator(config, Arc::new(store))
    }

    /// Create a gateway with a custom validator
    #[must_use]
    pub fn with_validator(config: Config, validator: Arc<dyn TokenValidator>) -> Self {
        let auth = Arc::new(AuthState::new(&config.auth, validator));
        let limits = Arc::new(RateLimitState::new(&config.rate_limit));
        let state = Arc::new(AppState {
            auth,
            limits,
            started_at: Instant::now(),
        });
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        Self {
            config,
            state,
            shutdown_tx,
        }
    }

    /// The router served by [`Self::run`]
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Handle that stops the server when sent to
    #[must_use]
    pub fn shutdown_handle(&self) -> tokio::sync::broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind the configured address and serve until a shutdown signal
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        self.state.limits.spawn_sweepers(&self.shutdown_tx);

        info!(version = env!("CARGO_PKG_VERSION"), addr = %local, "Conduit gateway listening");
        if self.config.auth.enabled {
            info!(
                exempt = ?self.config.auth.exempt_paths,
                websocket_deferred = self.config.auth.websocket_deferred,
                "Authentication enabled"
            );
        } else {
            warn!("AUTHENTICATION disabled - gateway is open to all requests");
        }

        let app = self.router();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let signal_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = signal_tx.send(());
        });

        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Shutting down gateway");
        });

        // Open WebSocket sessions would otherwise hold the drain forever
        let mut drain_rx = self.shutdown_tx.subscribe();
        let drain_timeout = self.config.server.shutdown_timeout;
        tokio::select! {
            result = server.into_future() => {
                result.map_err(|e| Error::Internal(e.to_string()))?;
            }
            () = async {
                let _ = drain_rx.recv().await;
                tokio::time::sleep(drain_timeout).await;
            } => {
                warn!(timeout_secs = drain_timeout.as_secs(), "Graceful shutdown timed out");
            }
        }

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
