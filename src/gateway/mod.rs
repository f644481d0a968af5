//! Gateway server implementation

pub mod auth;
pub mod rate_limit;
mod router;
mod server;
pub mod websocket;

pub use auth::{AuthFailure, AuthFailureHook, AuthState, auth_middleware, rejection_response};
pub use rate_limit::{RateLimitState, client_ip, rate_limit_middleware, scrub_ip};
pub use router::{AppState, create_router};
pub use server::Gateway;
pub use websocket::{CLOSE_FORBIDDEN, CLOSE_UNAUTHORIZED, WS_PATH, WebSocketAuthenticator};
