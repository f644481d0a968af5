//! Delegated token storage
//!
//! Persists tokens obtained from upstream providers in a single JSON
//! document, `<dir>/tokens.json`:
//!
//! ```json
//! { "version": 1, "providers": { "anthropic": { "access_token": "...", ... } } }
//! ```
//!
//! Every mutation reads the whole document, applies the change and writes
//! the whole document back through a sibling temp file and a rename, so the
//! destination is never observed half-written. There is no cross-process
//! locking: concurrent writers from separate processes can lose updates.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// Current document format version
pub const DOCUMENT_VERSION: u32 = 1;

/// File name inside the token directory
pub const TOKEN_FILE_NAME: &str = "tokens.json";

/// Tokens are treated as expired this long before their actual expiry
const EXPIRY_SKEW_SECS: i64 = 60;

/// A delegated OAuth token for one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    /// Access token
    pub access_token: String,

    /// Refresh token, if the provider issued one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Expiry (Unix seconds)
    pub expires_at: i64,

    /// Granted scopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// When the token was obtained (Unix seconds)
    pub obtained_at: i64,

    /// Client ID the token was issued to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl StoredToken {
    /// Whether the token is expired or within 60 seconds of expiring
    #[must_use]
    pub fn is_expired(&self) -> bool {
        unix_now() + EXPIRY_SKEW_SECS >= self.expires_at
    }

    /// Time left until expiry, `None` once expired
    #[must_use]
    pub fn expires_in(&self) -> Option<Duration> {
        let remaining = self.expires_at - unix_now();
        u64::try_from(remaining)
            .ok()
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }
}

/// The on-disk document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDocument {
    /// Format version
    pub version: u32,
    /// Tokens keyed by provider name
    #[serde(default)]
    pub providers: BTreeMap<String, StoredToken>,
}

impl Default for TokenDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            providers: BTreeMap::new(),
        }
    }
}

/// File-backed store for delegated provider tokens
#[derive(Debug, Clone)]
pub struct DelegatedTokenStore {
    dir: PathBuf,
    path: PathBuf,
    legacy_path: Option<PathBuf>,
}

impl DelegatedTokenStore {
    /// Store rooted at `dir`. Nothing is touched on disk until the first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let path = dir.join(TOKEN_FILE_NAME);
        Self {
            dir,
            path,
            legacy_path: None,
        }
    }

    /// Also migrate from a file written by an older release
    #[must_use]
    pub fn with_legacy_path(mut self, legacy: impl Into<PathBuf>) -> Self {
        self.legacy_path = Some(legacy.into());
        self
    }

    /// Path of the token document
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy the legacy file into place if it exists and the new file does not.
    ///
    /// Safe to call on every load. Returns `true` if a copy happened.
    pub fn migrate_legacy(&self) -> Result<bool> {
        let Some(legacy) = self.legacy_path.as_deref() else {
            return Ok(false);
        };
        if self.path.exists() || !legacy.exists() {
            return Ok(false);
        }

        let content = fs::read(legacy)?;
        // Refuse to carry over something that is not a token document
        serde_json::from_slice::<TokenDocument>(&content)?;

        self.write_atomic(&content)?;
        info!(from = %legacy.display(), to = %self.path.display(), "Migrated legacy token file");
        Ok(true)
    }

    /// Read the whole document. A missing file is an empty document.
    pub fn load(&self) -> Result<TokenDocument> {
        self.migrate_legacy()?;

        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No token file, starting empty");
                return Ok(TokenDocument::default());
            }
            Err(e) => return Err(e.into()),
        };

        let doc: TokenDocument = serde_json::from_str(&content)?;
        if doc.version > DOCUMENT_VERSION {
            return Err(Error::Storage(format!(
                "token file version {} is newer than supported version {DOCUMENT_VERSION}",
                doc.version
            )));
        }
        Ok(doc)
    }

    /// Token for one provider
    pub fn get(&self, provider: &str) -> Result<Option<StoredToken>> {
        Ok(self.load()?.providers.remove(provider))
    }

    /// Create or replace the token for a provider
    pub fn save(&self, provider: &str, token: &StoredToken) -> Result<()> {
        self.update(|doc| {
            doc.providers.insert(provider.to_string(), token.clone());
        })?;
        info!(provider = %provider, expires_at = token.expires_at, "Saved OAuth token");
        Ok(())
    }

    /// Remove the token for a provider. Returns `true` if one existed.
    pub fn delete(&self, provider: &str) -> Result<bool> {
        let removed = self.update(|doc| doc.providers.remove(provider).is_some())?;
        if removed {
            info!(provider = %provider, "Deleted OAuth token");
        }
        Ok(removed)
    }

    /// Provider names with a stored token
    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self.load()?.providers.into_keys().collect())
    }

    fn update<T>(&self, mutate: impl FnOnce(&mut TokenDocument) -> T) -> Result<T> {
        let mut doc = self.load()?;
        let out = mutate(&mut doc);
        doc.version = DOCUMENT_VERSION;
        let content = serde_json::to_vec_pretty(&doc)?;
        self.write_atomic(&content)?;
        Ok(out)
    }

    /// Write to a sibling temp file (mode 0600) and rename over the target
    fn write_atomic(&self, content: &[u8]) -> Result<()> {
        ensure_private_dir(&self.dir)?;

        let tmp = self
            .path
            .with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));

        let written = (|| -> std::io::Result<()> {
            let mut file = private_file(&tmp)?;
            file.write_all(content)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(Error::Storage(format!(
                "failed to write {}: {e}",
                self.path.display()
            )));
        }
        Ok(())
    }
}

fn ensure_private_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        return Ok(());
    }

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(dir)
        .map_err(|e| Error::Storage(format!("failed to create {}: {e}", dir.display())))
}

fn private_file(path: &Path) -> std::io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

pub(crate) fn unix_now() -> i64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    i64::try_from(secs).unwrap_or(i64::MAX)
}
