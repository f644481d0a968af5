//! Delegated OAuth for upstream providers
//!
//! Implements the Authorization Code flow with PKCE (RFC 7636):
//!
//! - PKCE verifier/challenge and CSRF state generation
//! - A transient local callback listener
//! - Code exchange and refresh against the provider token endpoint
//! - File-backed storage of the resulting tokens

pub mod callback;
pub mod client;
pub mod pkce;
pub mod storage;

pub use callback::{CallbackParams, CallbackServer};
pub use client::{
    AuthorizeRequest, Browser, DEFAULT_EXPIRES_IN_SECS, FlowState, OAuthFlow, RefreshFlow,
    SystemBrowser, build_authorize_url,
};
pub use pkce::{Pkce, compute_code_challenge, generate_state};
pub use storage::{DelegatedTokenStore, StoredToken, TokenDocument};
