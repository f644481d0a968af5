//! Conduit Gateway Library
//!
//! Trust-boundary core of a gateway brokering access between downstream
//! clients and upstream AI providers.
//!
//! # Features
//!
//! - **Credential extraction**: Bearer, `X-API-Key`, WebSocket subprotocol and
//!   query-parameter sources in fixed priority order
//! - **Delegated OAuth**: Authorization Code + PKCE login and refresh against
//!   the upstream provider, tokens kept in a private JSON file
//! - **Service tokens**: hashed, revocable client tokens in SQLite
//! - **Middleware**: HTTP and WebSocket authentication with generic error
//!   surfaces
//! - **Rate limiting**: sliding-window limits per client IP or client name

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod oauth;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))?,
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))?,
    }

    Ok(())
}
