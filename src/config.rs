//! Configuration management

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{Error, Result};

/// Environment variable that overrides the delegated token directory
pub const TOKEN_DIR_ENV: &str = "CONDUIT_TOKEN_DIR";

/// Default OAuth authorize endpoint
pub const DEFAULT_AUTHORIZE_URL: &str = "https://claude.ai/oauth/authorize";

/// Default OAuth token endpoint
pub const DEFAULT_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Inbound authentication configuration
    pub auth: AuthConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// Upstream OAuth configuration
    pub oauth: OAuthConfig,
    /// Local storage configuration
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // CONDUIT_OAUTH__TOKEN_URL -> oauth.token_url
        figment = figment.merge(Env::prefixed("CONDUIT_").split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Service token database: `auth.database_path`, else `conduit.db` in
    /// the resolved data directory
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.auth.database_path {
            return Ok(path.clone());
        }
        self.storage
            .resolve_token_dir()
            .map(|dir| dir.join("conduit.db"))
            .ok_or_else(|| Error::Config("cannot determine data directory".to_string()))
    }

    /// Delegated token directory, failing when no home directory is known
    pub fn token_dir(&self) -> Result<PathBuf> {
        self.storage
            .resolve_token_dir()
            .ok_or_else(|| Error::Config("cannot determine token directory".to_string()))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8420,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Authentication configuration for inbound clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable authentication
    pub enabled: bool,

    /// Path to the service token database (default: `<data dir>/conduit.db`)
    pub database_path: Option<PathBuf>,

    /// Paths that bypass authentication (default: `["/health"]`)
    pub exempt_paths: Vec<String>,

    /// Reject unauthenticated WebSocket clients after the upgrade with a
    /// 44xx close frame instead of an HTTP error
    pub websocket_deferred: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_path: None,
            exempt_paths: vec!["/health".to_string()],
            websocket_deferred: false,
        }
    }
}

/// Rate limiting configuration: one limiter for anonymous callers, one for
/// authenticated clients.
///
/// A partially configured limiter keeps its own defaults for the fields it
/// leaves out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Limiter keyed by client IP
    #[serde(deserialize_with = "anonymous_limiter")]
    pub anonymous: LimiterConfig,
    /// Limiter keyed by client name
    #[serde(deserialize_with = "authenticated_limiter")]
    pub authenticated: LimiterConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            anonymous: LimiterConfig::anonymous(),
            authenticated: LimiterConfig::authenticated(),
        }
    }
}

/// Sliding-window limiter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Enable this limiter
    pub enabled: bool,
    /// Requests admitted per window
    pub max_requests: u32,
    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Interval of the idle-bucket sweep
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl LimiterConfig {
    /// Per-IP defaults: 60 requests a minute
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Per-client defaults: 600 requests a minute
    #[must_use]
    pub fn authenticated() -> Self {
        Self {
            max_requests: 600,
            ..Self::default()
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 60,
            window: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Limiter fields as written in configuration
#[derive(Deserialize)]
struct LimiterOverrides {
    enabled: Option<bool>,
    max_requests: Option<u32>,
    #[serde(default, deserialize_with = "humantime_serde::deserialize_option")]
    window: Option<Duration>,
    #[serde(default, deserialize_with = "humantime_serde::deserialize_option")]
    cleanup_interval: Option<Duration>,
}

impl LimiterOverrides {
    fn apply(self, base: LimiterConfig) -> LimiterConfig {
        LimiterConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            max_requests: self.max_requests.unwrap_or(base.max_requests),
            window: self.window.unwrap_or(base.window),
            cleanup_interval: self.cleanup_interval.unwrap_or(base.cleanup_interval),
        }
    }
}

fn anonymous_limiter<'de, D>(deserializer: D) -> std::result::Result<LimiterConfig, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(LimiterOverrides::deserialize(deserializer)?.apply(LimiterConfig::anonymous()))
}

fn authenticated_limiter<'de, D>(deserializer: D) -> std::result::Result<LimiterConfig, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(LimiterOverrides::deserialize(deserializer)?.apply(LimiterConfig::authenticated()))
}

/// Upstream OAuth provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Provider name used as the key in the delegated token file
    pub provider: String,
    /// Registered client ID
    pub client_id: Option<String>,
    /// Authorize endpoint
    pub authorize_url: String,
    /// Token endpoint
    pub token_url: String,
    /// Scopes to request
    pub scopes: Vec<String>,
    /// Preferred local callback port
    pub callback_port: Option<u16>,
    /// Fallback callback ports tried in order after the preferred one
    pub fallback_ports: Vec<u16>,
    /// How long to wait for the browser redirect
    #[serde(with = "humantime_serde")]
    pub callback_timeout: Duration,
    /// Timeout of each token endpoint request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            client_id: None,
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            scopes: vec!["user:inference".to_string()],
            callback_port: Some(54545),
            fallback_ports: (54546..=54555).collect(),
            callback_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl OAuthConfig {
    /// Return the configured client ID or a configuration error
    pub fn require_client_id(&self) -> Result<&str> {
        self.client_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| Error::Config("oauth.client_id is not set".to_string()))
    }
}

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the delegated token file
    pub token_dir: Option<PathBuf>,
    /// Location of a token file written by older releases
    pub legacy_token_file: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the delegated token directory from the process environment,
    /// this configuration and the home directory.
    #[must_use]
    pub fn resolve_token_dir(&self) -> Option<PathBuf> {
        resolve_token_dir(
            std::env::var_os(TOKEN_DIR_ENV),
            self.token_dir.as_deref(),
            dirs::home_dir(),
        )
    }

    /// Resolve the legacy token file, defaulting to `~/.config/conduit/tokens.json`
    #[must_use]
    pub fn resolve_legacy_file(&self) -> Option<PathBuf> {
        self.legacy_token_file.clone().or_else(|| {
            dirs::home_dir().map(|home| home.join(".config").join("conduit").join("tokens.json"))
        })
    }
}

/// Directory priority: environment override, configured value, `~/.conduit`
#[must_use]
pub fn resolve_token_dir(
    env_override: Option<OsString>,
    configured: Option<&Path>,
    home: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(dir) = env_override.filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    if let Some(dir) = configured {
        return Some(dir.to_path_buf());
    }
    home.map(|h| h.join(".conduit"))
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }

    /// [`deserialize`] for an optional field
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if a present value is not a duration.
    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Human(#[serde(deserialize_with = "self::deserialize")] Duration);

        Ok(Option::<Human>::deserialize(deserializer)?.map(|Human(d)| d))
    }
}
