//! OAuth Client
//!
//! Authorization Code + PKCE login against an upstream provider, and the
//! refresh-token grant used to renew the resulting access token.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::callback::{CallbackParams, CallbackServer};
use super::pkce::{self, CHALLENGE_METHOD, Pkce};
use super::storage::{DelegatedTokenStore, StoredToken, unix_now};
use crate::config::OAuthConfig;
use crate::failsafe::{RetryPolicy, with_retry};
use crate::{Error, Result};

/// Lifetime assumed when the provider omits `expires_in`
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Opens the authorize URL for the user
#[async_trait]
pub trait Browser: Send + Sync {
    /// Direct the user to `url`
    async fn open(&self, url: &Url) -> Result<()>;
}

/// Opens the system browser, printing the URL if that fails
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

#[async_trait]
impl Browser for SystemBrowser {
    async fn open(&self, url: &Url) -> Result<()> {
        info!("Opening browser for authorization");
        if let Err(e) = open::that(url.as_str()) {
            warn!(error = %e, "Failed to open browser automatically");
            println!("\nPlease authorize by visiting:\n{url}\n");
        }
        Ok(())
    }
}

/// Login progress, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Not started
    Idle,
    /// Creating verifier, challenge and state
    GeneratingPkce,
    /// Listener up, browser opened
    AwaitingCallback,
    /// Trading the code for tokens
    ExchangingCode,
    /// Token persisted
    Stored,
    /// Aborted; nothing persisted
    Failed,
}

/// Parameters of the authorize request
#[derive(Debug, Clone)]
pub struct AuthorizeRequest<'a> {
    /// Provider authorize endpoint
    pub authorize_url: &'a str,
    /// OAuth client ID
    pub client_id: &'a str,
    /// S256 code challenge
    pub code_challenge: &'a str,
    /// Local callback URI
    pub redirect_uri: &'a str,
    /// Requested scopes
    pub scopes: &'a [String],
    /// CSRF state
    pub state: &'a str,
}

/// Build the URL the user is sent to
pub fn build_authorize_url(req: &AuthorizeRequest<'_>) -> Result<Url> {
    let mut url = Url::parse(req.authorize_url)
        .map_err(|e| Error::Config(format!("Invalid authorize URL: {e}")))?;
    url.query_pairs_mut()
        .append_pair("client_id", req.client_id)
        .append_pair("response_type", "code")
        .append_pair("code_challenge", req.code_challenge)
        .append_pair("code_challenge_method", CHALLENGE_METHOD)
        .append_pair("redirect_uri", req.redirect_uri)
        .append_pair("scope", &req.scopes.join(" "))
        .append_pair("state", req.state);
    Ok(url)
}

/// Token endpoint response; errors may arrive with any status
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    scope: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Fields of an earlier token that survive a response omitting them
#[derive(Debug, Clone, Copy, Default)]
struct Carried<'a> {
    refresh_token: Option<&'a str>,
    token_type: Option<&'a str>,
    scope: Option<&'a str>,
}

impl<'a> Carried<'a> {
    fn from_token(token: &'a StoredToken) -> Self {
        Self {
            refresh_token: token.refresh_token.as_deref(),
            token_type: Some(token.token_type.as_str()),
            scope: token.scope.as_deref(),
        }
    }
}

impl TokenResponse {
    fn into_stored(self, client_id: &str, carried: Carried<'_>) -> Result<StoredToken> {
        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::UpstreamExchange {
                status: None,
                message: "response carried no access_token".to_string(),
            })?;

        let now = unix_now();
        let expires_in = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        Ok(StoredToken {
            access_token,
            refresh_token: self
                .refresh_token
                .filter(|t| !t.is_empty())
                .or_else(|| carried.refresh_token.map(str::to_string)),
            token_type: self
                .token_type
                .or_else(|| carried.token_type.map(str::to_string))
                .unwrap_or_else(|| "Bearer".to_string()),
            expires_at: now.saturating_add(i64::try_from(expires_in).unwrap_or(i64::MAX)),
            scope: self.scope.or_else(|| carried.scope.map(str::to_string)),
            obtained_at: now,
            client_id: Some(client_id.to_string()),
        })
    }
}

/// Form-encoded POSTs to the provider token endpoint
#[derive(Clone)]
struct TokenEndpoint {
    http: Client,
    url: String,
    retry: RetryPolicy,
}

impl TokenEndpoint {
    fn new(config: &OAuthConfig, retry: RetryPolicy) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: config.token_url.clone(),
            retry,
        })
    }

    async fn request(&self, grant: &str, form: &[(&str, &str)]) -> Result<TokenResponse> {
        with_retry(&self.retry, grant, move || self.post_once(form)).await
    }

    async fn post_once(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let parsed = serde_json::from_str::<TokenResponse>(&body);

        // A structured error fails the exchange whatever the status says
        if let Ok(TokenResponse {
            error: Some(error),
            error_description,
            ..
        }) = &parsed
        {
            let description = error_description.as_deref().unwrap_or("no description");
            return Err(Error::UpstreamExchange {
                status: Some(status.as_u16()),
                message: format!("{error}: {description}"),
            });
        }

        if !status.is_success() {
            return Err(Error::UpstreamExchange {
                status: Some(status.as_u16()),
                message: truncate(&body, 200),
            });
        }

        parsed.map_err(|e| Error::UpstreamExchange {
            status: Some(status.as_u16()),
            message: format!("invalid token response: {e}"),
        })
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Renews an access token with the refresh-token grant
#[derive(Clone)]
pub struct RefreshFlow {
    endpoint: TokenEndpoint,
}

impl RefreshFlow {
    /// Refresh flow against `config.token_url`
    pub fn new(config: &OAuthConfig) -> Result<Self> {
        Ok(Self {
            endpoint: TokenEndpoint::new(config, RetryPolicy::default())?,
        })
    }

    /// Override the retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.endpoint.retry = retry;
        self
    }

    /// Exchange `refresh_token` for a new token. The old refresh token is
    /// kept when the provider does not issue a new one.
    pub async fn refresh(&self, refresh_token: &str, client_id: &str) -> Result<StoredToken> {
        let carried = Carried {
            refresh_token: Some(refresh_token),
            ..Carried::default()
        };
        self.exchange(refresh_token, client_id, carried).await
    }

    /// Refresh `current` in place of a new login. Refresh token, token type
    /// and scope carry over when the provider omits them.
    pub async fn renew(&self, current: &StoredToken, client_id: &str) -> Result<StoredToken> {
        let refresh_token = current
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::InvalidInput("stored token has no refresh token".to_string()))?;
        self.exchange(refresh_token, client_id, Carried::from_token(current))
            .await
    }

    async fn exchange(
        &self,
        refresh_token: &str,
        client_id: &str,
        carried: Carried<'_>,
    ) -> Result<StoredToken> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
        ];
        let response = self.endpoint.request("refresh_token", &form).await?;
        let token = response.into_stored(client_id, carried)?;
        debug!(expires_at = token.expires_at, "Token refreshed");
        Ok(token)
    }
}

/// Delegated login for one provider
pub struct OAuthFlow {
    config: OAuthConfig,
    store: DelegatedTokenStore,
    endpoint: TokenEndpoint,
    refresher: RefreshFlow,
    browser: Arc<dyn Browser>,
}

impl OAuthFlow {
    /// Flow using the system browser
    pub fn new(config: OAuthConfig, store: DelegatedTokenStore) -> Result<Self> {
        let endpoint = TokenEndpoint::new(&config, RetryPolicy::default())?;
        let refresher = RefreshFlow {
            endpoint: endpoint.clone(),
        };
        Ok(Self {
            config,
            store,
            endpoint,
            refresher,
            browser: Arc::new(SystemBrowser),
        })
    }

    /// Replace the browser
    #[must_use]
    pub fn with_browser(mut self, browser: Arc<dyn Browser>) -> Self {
        self.browser = browser;
        self
    }

    /// Override the retry policy for token endpoint calls
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.endpoint.retry = retry;
        self.refresher.endpoint.retry = retry;
        self
    }

    /// Provider name tokens are stored under
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.config.provider
    }

    /// Token store backing this flow
    #[must_use]
    pub fn store(&self) -> &DelegatedTokenStore {
        &self.store
    }

    /// Run the full login. The token is persisted only on success.
    pub async fn login(&self, cancel: &CancellationToken) -> Result<StoredToken> {
        let mut state = FlowState::Idle;
        let result = self.run_login(&mut state, cancel).await;
        match &result {
            Ok(_) => transition(&mut state, FlowState::Stored),
            Err(e) => {
                warn!(provider = %self.config.provider, from = ?state, error = %e, "OAuth login failed");
                transition(&mut state, FlowState::Failed);
            }
        }
        result
    }

    async fn run_login(&self, state: &mut FlowState, cancel: &CancellationToken) -> Result<StoredToken> {
        let client_id = self.config.require_client_id()?;

        transition(state, FlowState::GeneratingPkce);
        let pkce = Pkce::generate();
        let csrf_state = pkce::generate_state();

        let server = CallbackServer::start(self.config.callback_port, &self.config.fallback_ports).await?;
        let redirect_uri = server.redirect_uri();
        let url = build_authorize_url(&AuthorizeRequest {
            authorize_url: &self.config.authorize_url,
            client_id,
            code_challenge: &pkce.challenge,
            redirect_uri: &redirect_uri,
            scopes: &self.config.scopes,
            state: &csrf_state,
        })?;

        transition(state, FlowState::AwaitingCallback);
        self.browser.open(&url).await?;
        let params = server.wait(self.config.callback_timeout, cancel).await?;
        let code = check_callback(params, &csrf_state)?;

        transition(state, FlowState::ExchangingCode);
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("client_id", client_id),
            ("code_verifier", pkce.verifier.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
        ];
        let response = tokio::select! {
            r = self.endpoint.request("authorization_code", &form) => r?,
            () = cancel.cancelled() => return Err(Error::Cancelled),
        };
        let token = response.into_stored(client_id, Carried::default())?;

        self.store.save(&self.config.provider, &token)?;
        info!(provider = %self.config.provider, "OAuth login complete");
        Ok(token)
    }

    /// Refresh the stored token and write it back
    pub async fn refresh(&self) -> Result<StoredToken> {
        let provider = &self.config.provider;
        let current = self
            .store
            .get(provider)?
            .ok_or_else(|| Error::NotFound(format!("no stored token for provider {provider}")))?;
        let client_id = match current.client_id.as_deref() {
            Some(id) => id,
            None => self.config.require_client_id()?,
        };

        let token = self.refresher.renew(&current, client_id).await?;
        self.store.save(provider, &token)?;
        Ok(token)
    }

    /// Current access token, refreshed first when close to expiry
    pub async fn access_token(&self) -> Result<String> {
        let provider = &self.config.provider;
        let current = self
            .store
            .get(provider)?
            .ok_or_else(|| Error::NotFound(format!("no stored token for provider {provider}")))?;
        if !current.is_expired() {
            return Ok(current.access_token);
        }
        debug!(provider = %provider, "Stored token near expiry, refreshing");
        Ok(self.refresh().await?.access_token)
    }
}

fn transition(state: &mut FlowState, next: FlowState) {
    debug!(from = ?state, to = ?next, "OAuth flow transition");
    *state = next;
}

/// Turn the captured redirect into an authorization code
fn check_callback(params: CallbackParams, expected_state: &str) -> Result<String> {
    if let Some(error) = params.error {
        return Err(Error::OAuthProvider {
            error,
            description: params
                .error_description
                .unwrap_or_else(|| "no description".to_string()),
        });
    }

    let received = params.state.unwrap_or_default();
    if !bool::from(received.as_bytes().ct_eq(expected_state.as_bytes())) {
        return Err(Error::CsrfStateMismatch);
    }

    params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::UpstreamExchange {
            status: None,
            message: "callback carried no authorization code".to_string(),
        })
}
