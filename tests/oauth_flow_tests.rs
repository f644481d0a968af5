//! Delegated OAuth flow tests
//!
//! Runs the login and refresh flows against a mock token endpoint, with a
//! scripted browser that follows the redirect the way a provider would.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{Form, Json, Router, extract::State, http::StatusCode, routing::post};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

use conduit::{
    Error, Result,
    config::OAuthConfig,
    failsafe::RetryPolicy,
    oauth::{Browser, DelegatedTokenStore, OAuthFlow, StoredToken, compute_code_challenge},
};

// ── Mock token endpoint ────────────────────────────────────────────────

#[derive(Default)]
struct MockProvider {
    replies: Mutex<VecDeque<(StatusCode, Value)>>,
    forms: Mutex<Vec<HashMap<String, String>>>,
}

impl MockProvider {
    fn reply(&self, status: StatusCode, body: Value) -> &Self {
        self.replies.lock().push_back((status, body));
        self
    }

    fn forms(&self) -> Vec<HashMap<String, String>> {
        self.forms.lock().clone()
    }
}

async fn token_handler(
    State(mock): State<Arc<MockProvider>>,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    mock.forms.lock().push(form);
    let (status, body) = mock.replies.lock().pop_front().unwrap_or((
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "error": "server_error", "error_description": "no scripted reply" }),
    ));
    (status, Json(body))
}

async fn start_provider() -> (Arc<MockProvider>, SocketAddr) {
    let mock = Arc::new(MockProvider::default());
    let app = Router::new()
        .route("/token", post(token_handler))
        .with_state(Arc::clone(&mock));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (mock, addr)
}

fn token_reply(access: &str, refresh: Option<&str>) -> Value {
    let mut body = json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": 3600,
        "scope": "user:inference",
    });
    if let Some(r) = refresh {
        body["refresh_token"] = json!(r);
    }
    body
}

// ── Scripted browser ───────────────────────────────────────────────────

enum Redirect {
    /// Echo the state back with a code
    Approve,
    /// Return a state the flow never issued
    ForgeState,
    /// Report a provider error
    Deny,
    /// Repeat the code parameter
    DuplicateCode,
}

struct ScriptedBrowser {
    redirect: Redirect,
    challenge: Mutex<Option<String>>,
}

impl ScriptedBrowser {
    fn new(redirect: Redirect) -> Arc<Self> {
        Arc::new(Self {
            redirect,
            challenge: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Browser for ScriptedBrowser {
    async fn open(&self, url: &Url) -> Result<()> {
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["code_challenge_method"], "S256");
        *self.challenge.lock() = Some(params["code_challenge"].clone());

        let mut callback = Url::parse(&params["redirect_uri"]).unwrap();
        match self.redirect {
            Redirect::Approve => {
                callback
                    .query_pairs_mut()
                    .append_pair("code", "auth-code-1")
                    .append_pair("state", &params["state"]);
            }
            Redirect::ForgeState => {
                callback
                    .query_pairs_mut()
                    .append_pair("code", "auth-code-1")
                    .append_pair("state", "forged");
            }
            Redirect::Deny => {
                callback
                    .query_pairs_mut()
                    .append_pair("error", "access_denied")
                    .append_pair("error_description", "user declined");
            }
            Redirect::DuplicateCode => {
                callback
                    .query_pairs_mut()
                    .append_pair("code", "auth-code-1")
                    .append_pair("code", "auth-code-2")
                    .append_pair("state", &params["state"]);
            }
        }

        let page = reqwest::get(callback).await.unwrap();
        assert!(page.status().is_success());
        Ok(())
    }
}

// ── Fixtures ───────────────────────────────────────────────────────────

fn oauth_config(provider: SocketAddr) -> OAuthConfig {
    OAuthConfig {
        provider: "test-provider".to_string(),
        client_id: Some("client-abc".to_string()),
        authorize_url: "https://auth.example.com/oauth/authorize".to_string(),
        token_url: format!("http://{provider}/token"),
        callback_port: None,
        fallback_ports: Vec::new(),
        callback_timeout: Duration::from_secs(5),
        ..OAuthConfig::default()
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        delay: Duration::from_millis(10),
        max_retries: 1,
    }
}

fn flow(dir: &tempfile::TempDir, provider: SocketAddr, browser: Arc<dyn Browser>) -> OAuthFlow {
    OAuthFlow::new(oauth_config(provider), DelegatedTokenStore::new(dir.path()))
        .unwrap()
        .with_browser(browser)
        .with_retry_policy(fast_retry())
}

fn stored(access: &str, refresh: Option<&str>, expires_in: i64) -> StoredToken {
    let now = chrono::Utc::now().timestamp();
    StoredToken {
        access_token: access.to_string(),
        refresh_token: refresh.map(str::to_string),
        token_type: "Bearer".to_string(),
        expires_at: now + expires_in,
        scope: None,
        obtained_at: now,
        client_id: Some("client-abc".to_string()),
    }
}

// ── Login ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn login_exchanges_code_and_stores_token() {
    let (mock, addr) = start_provider().await;
    mock.reply(StatusCode::OK, token_reply("access-1", Some("refresh-1")));
    let dir = tempfile::tempdir().unwrap();
    let browser = ScriptedBrowser::new(Redirect::Approve);
    let flow = flow(&dir, addr, browser.clone());

    let token = flow.login(&CancellationToken::new()).await.unwrap();
    assert_eq!(token.access_token, "access-1");
    assert_eq!(token.refresh_token.as_deref(), Some("refresh-1"));
    assert_eq!(token.scope.as_deref(), Some("user:inference"));

    let forms = mock.forms();
    assert_eq!(forms.len(), 1);
    let form = &forms[0];
    assert_eq!(form["grant_type"], "authorization_code");
    assert_eq!(form["code"], "auth-code-1");
    assert_eq!(form["client_id"], "client-abc");
    assert!(form["redirect_uri"].starts_with("http://127.0.0.1:"));
    assert!(form["redirect_uri"].ends_with("/callback"));

    // The verifier sent to the token endpoint matches the challenge the
    // browser was given
    let challenge = browser.challenge.lock().clone().unwrap();
    assert_eq!(compute_code_challenge(&form["code_verifier"]), challenge);

    let saved = flow.store().get("test-provider").unwrap().unwrap();
    assert_eq!(saved, token);
}

#[tokio::test]
async fn forged_state_is_rejected_without_exchange() {
    let (mock, addr) = start_provider().await;
    mock.reply(StatusCode::OK, token_reply("access-1", None));
    let dir = tempfile::tempdir().unwrap();
    let flow = flow(&dir, addr, ScriptedBrowser::new(Redirect::ForgeState));

    let err = flow.login(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::CsrfStateMismatch), "got {err:?}");
    assert!(mock.forms().is_empty());
    assert!(!flow.store().path().exists());
}

#[tokio::test]
async fn provider_error_redirect_fails_login() {
    let (mock, addr) = start_provider().await;
    let dir = tempfile::tempdir().unwrap();
    let flow = flow(&dir, addr, ScriptedBrowser::new(Redirect::Deny));

    let err = flow.login(&CancellationToken::new()).await.unwrap_err();
    match err {
        Error::OAuthProvider { error, description } => {
            assert_eq!(error, "access_denied");
            assert_eq!(description, "user declined");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(mock.forms().is_empty());
    assert!(!flow.store().path().exists());
}

#[tokio::test]
async fn malformed_redirect_fails_login_promptly() {
    let (mock, addr) = start_provider().await;
    let dir = tempfile::tempdir().unwrap();
    let flow = flow(&dir, addr, ScriptedBrowser::new(Redirect::DuplicateCode));

    let err = tokio::time::timeout(Duration::from_secs(2), flow.login(&CancellationToken::new()))
        .await
        .unwrap()
        .unwrap_err();
    match err {
        Error::OAuthProvider { error, description } => {
            assert_eq!(error, "invalid_request");
            assert_eq!(description, "malformed callback query");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(mock.forms().is_empty());
}

#[tokio::test]
async fn login_without_client_id_is_a_config_error() {
    let (_, addr) = start_provider().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = oauth_config(addr);
    config.client_id = None;
    let flow = OAuthFlow::new(config, DelegatedTokenStore::new(dir.path()))
        .unwrap()
        .with_browser(ScriptedBrowser::new(Redirect::Approve));

    let err = flow.login(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {err:?}");
}

#[tokio::test]
async fn server_error_is_retried_once() {
    let (mock, addr) = start_provider().await;
    mock.reply(StatusCode::SERVICE_UNAVAILABLE, json!({ "message": "busy" }))
        .reply(StatusCode::OK, token_reply("access-2", None));
    let dir = tempfile::tempdir().unwrap();
    let flow = flow(&dir, addr, ScriptedBrowser::new(Redirect::Approve));

    let token = flow.login(&CancellationToken::new()).await.unwrap();
    assert_eq!(token.access_token, "access-2");
    assert_eq!(mock.forms().len(), 2);
}

#[tokio::test]
async fn repeated_server_error_is_terminal() {
    let (mock, addr) = start_provider().await;
    mock.reply(StatusCode::BAD_GATEWAY, json!({}))
        .reply(StatusCode::BAD_GATEWAY, json!({}));
    let dir = tempfile::tempdir().unwrap();
    let flow = flow(&dir, addr, ScriptedBrowser::new(Redirect::Approve));

    let err = flow.login(&CancellationToken::new()).await.unwrap_err();
    assert!(
        matches!(err, Error::UpstreamExchange { status: Some(502), .. }),
        "got {err:?}"
    );
    assert_eq!(mock.forms().len(), 2);
    assert!(!flow.store().path().exists());
}

#[tokio::test]
async fn error_body_with_success_status_is_not_retried() {
    let (mock, addr) = start_provider().await;
    mock.reply(
        StatusCode::OK,
        json!({ "error": "invalid_grant", "error_description": "code expired" }),
    );
    let dir = tempfile::tempdir().unwrap();
    let flow = flow(&dir, addr, ScriptedBrowser::new(Redirect::Approve));

    let err = flow.login(&CancellationToken::new()).await.unwrap_err();
    match err {
        Error::UpstreamExchange { status, message } => {
            assert_eq!(status, Some(200));
            assert!(message.contains("invalid_grant"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(mock.forms().len(), 1);
}

#[tokio::test]
async fn cancelled_login_stores_nothing() {
    struct NeverRedirects;

    #[async_trait]
    impl Browser for NeverRedirects {
        async fn open(&self, _url: &Url) -> Result<()> {
            Ok(())
        }
    }

    let (_, addr) = start_provider().await;
    let dir = tempfile::tempdir().unwrap();
    let flow = flow(&dir, addr, Arc::new(NeverRedirects));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = flow.login(&cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled), "got {err:?}");
    assert!(!flow.store().path().exists());
}

// ── Refresh ────────────────────────────────────────────────────────────

#[tokio::test]
async fn refresh_keeps_previous_refresh_token() {
    let (mock, addr) = start_provider().await;
    mock.reply(StatusCode::OK, token_reply("access-new", None));
    let dir = tempfile::tempdir().unwrap();
    let flow = flow(&dir, addr, ScriptedBrowser::new(Redirect::Approve));
    flow.store()
        .save("test-provider", &stored("access-old", Some("refresh-old"), 3600))
        .unwrap();

    let token = flow.refresh().await.unwrap();
    assert_eq!(token.access_token, "access-new");
    assert_eq!(token.refresh_token.as_deref(), Some("refresh-old"));

    let form = &mock.forms()[0];
    assert_eq!(form["grant_type"], "refresh_token");
    assert_eq!(form["refresh_token"], "refresh-old");
    assert_eq!(form["client_id"], "client-abc");

    let saved = flow.store().get("test-provider").unwrap().unwrap();
    assert_eq!(saved.access_token, "access-new");
    assert_eq!(saved.scope.as_deref(), Some("user:inference"));
}

#[tokio::test]
async fn refresh_keeps_scope_when_provider_omits_it() {
    let (mock, addr) = start_provider().await;
    mock.reply(
        StatusCode::OK,
        json!({ "access_token": "access-new", "expires_in": 3600 }),
    );
    let dir = tempfile::tempdir().unwrap();
    let flow = flow(&dir, addr, ScriptedBrowser::new(Redirect::Approve));
    let previous = StoredToken {
        scope: Some("user:inference org:read".to_string()),
        ..stored("access-old", Some("refresh-old"), 3600)
    };
    flow.store().save("test-provider", &previous).unwrap();

    let token = flow.refresh().await.unwrap();
    assert_eq!(token.access_token, "access-new");
    assert_eq!(token.scope.as_deref(), Some("user:inference org:read"));
    assert_eq!(token.token_type, "Bearer");

    let saved = flow.store().get("test-provider").unwrap().unwrap();
    assert_eq!(saved.scope.as_deref(), Some("user:inference org:read"));
}

#[tokio::test]
async fn refresh_without_refresh_token_fails() {
    let (mock, addr) = start_provider().await;
    let dir = tempfile::tempdir().unwrap();
    let flow = flow(&dir, addr, ScriptedBrowser::new(Redirect::Approve));
    flow.store()
        .save("test-provider", &stored("access-old", None, 3600))
        .unwrap();

    assert!(flow.refresh().await.is_err());
    assert!(mock.forms().is_empty());
}

#[tokio::test]
async fn access_token_refreshes_only_near_expiry() {
    let (mock, addr) = start_provider().await;
    mock.reply(StatusCode::OK, token_reply("access-new", Some("refresh-new")));
    let dir = tempfile::tempdir().unwrap();
    let flow = flow(&dir, addr, ScriptedBrowser::new(Redirect::Approve));

    flow.store()
        .save("test-provider", &stored("access-fresh", Some("refresh-old"), 3600))
        .unwrap();
    assert_eq!(flow.access_token().await.unwrap(), "access-fresh");
    assert!(mock.forms().is_empty());

    // Inside the expiry skew
    flow.store()
        .save("test-provider", &stored("access-stale", Some("refresh-old"), 30))
        .unwrap();
    assert_eq!(flow.access_token().await.unwrap(), "access-new");
    assert_eq!(mock.forms().len(), 1);

    let saved = flow.store().get("test-provider").unwrap().unwrap();
    assert_eq!(saved.refresh_token.as_deref(), Some("refresh-new"));
}

#[tokio::test]
async fn access_token_without_login_is_not_found() {
    let (_, addr) = start_provider().await;
    let dir = tempfile::tempdir().unwrap();
    let flow = flow(&dir, addr, ScriptedBrowser::new(Redirect::Approve));

    let err = flow.access_token().await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
}
