//! Service token store: tokens the gateway issues to its own clients.
//!
//! Raw tokens are `cdt_` followed by 64 hex characters (256 bits). Only the
//! SHA-256 of the raw value is persisted; the raw value is returned exactly
//! once, from [`ServiceTokenStore::create_token`].
//!
//! Revocation is a soft delete (`is_active = 0`) so the row remains for
//! audit. Rows are removed only by [`ServiceTokenStore::delete_token`] or
//! [`ServiceTokenStore::cleanup_expired_tokens`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::hash_token;
use crate::{Error, Result};

/// Prefix of every raw service token
pub const TOKEN_PREFIX: &str = "cdt_";

const COLUMNS: &str = "token_id, client_name, hashed_token, created_at, expires_at, \
                       last_used_at, is_active, metadata";

/// A service token at rest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    /// Token ID
    pub token_id: Uuid,
    /// Client the token was issued to
    pub client_name: String,
    /// SHA-256 hex of the raw token
    #[serde(skip_serializing)]
    pub hashed_token: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiry; `None` never expires
    pub expires_at: Option<DateTime<Utc>>,
    /// Last successful validation
    pub last_used_at: Option<DateTime<Utc>>,
    /// `false` once revoked
    pub is_active: bool,
    /// Free-form metadata
    pub metadata: HashMap<String, String>,
}

impl AuthToken {
    /// Whether the expiry lies in the past. Independent of `is_active`.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| exp <= Utc::now())
    }
}

/// Parameters for minting a token
#[derive(Debug, Clone, Default)]
pub struct CreateTokenRequest {
    /// Client name, must be non-empty after trimming
    pub client_name: String,
    /// Optional absolute expiry
    pub expires_at: Option<DateTime<Utc>>,
    /// Initial metadata
    pub metadata: HashMap<String, String>,
}

impl CreateTokenRequest {
    /// Request a non-expiring token for `client_name`
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            ..Self::default()
        }
    }

    /// Expire the token `ttl` from now
    #[must_use]
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        self
    }
}

/// A freshly minted token. `token` is the only copy of the raw value.
#[derive(Debug, Clone)]
pub struct CreatedToken {
    /// Raw token to hand to the client
    pub token: String,
    /// Stored record
    pub info: AuthToken,
}

/// Validation seam used by the gateway middleware.
#[async_trait]
pub trait TokenValidator: Send + Sync + 'static {
    /// Validate a raw token presented by a client.
    ///
    /// Fails with [`Error::InvalidCredential`] for unknown or revoked tokens
    /// and [`Error::ExpiredCredential`] for expired ones.
    async fn validate_token(&self, raw: &str) -> Result<AuthToken>;
}

/// SQLite-backed service token store
#[derive(Clone)]
pub struct ServiceTokenStore {
    pool: SqlitePool,
}

impl ServiceTokenStore {
    /// Open (creating if needed) the token database at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!(path = %path.display(), "Opened service token database");
        Self::from_pool(pool).await
    }

    /// In-memory database. A single connection that is never recycled, so
    /// the data lives as long as the store.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and run migrations
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Mint a new token for a client
    pub async fn create_token(&self, request: CreateTokenRequest) -> Result<CreatedToken> {
        let client_name = request.client_name.trim();
        if client_name.is_empty() {
            return Err(Error::InvalidInput("client name must not be empty".to_string()));
        }

        let raw = generate_raw_token();
        let info = AuthToken {
            token_id: Uuid::new_v4(),
            client_name: client_name.to_string(),
            hashed_token: hash_token(&raw),
            created_at: now_millis(),
            expires_at: request.expires_at.map(truncate_millis),
            last_used_at: None,
            is_active: true,
            metadata: request.metadata,
        };

        self.insert(&info).await?;

        info!(
            token_id = %info.token_id,
            client = %info.client_name,
            expires_at = ?info.expires_at,
            "Created service token"
        );
        Ok(CreatedToken { token: raw, info })
    }

    pub(crate) async fn insert(&self, token: &AuthToken) -> Result<()> {
        let metadata = serde_json::to_string(&token.metadata)?;

        sqlx::query(
            "INSERT INTO auth_tokens (token_id, client_name, hashed_token, created_at, \
             expires_at, last_used_at, is_active, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(token.token_id.to_string())
        .bind(&token.client_name)
        .bind(&token.hashed_token)
        .bind(token.created_at.timestamp_millis())
        .bind(token.expires_at.map(|t| t.timestamp_millis()))
        .bind(token.last_used_at.map(|t| t.timestamp_millis()))
        .bind(i64::from(token.is_active))
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Validate a raw token. Expiry is checked independently of the active
    /// flag. On success `last_used_at` is updated; a failure to record it is
    /// logged and ignored.
    pub async fn validate_token(&self, raw: &str) -> Result<AuthToken> {
        let hashed = hash_token(raw);

        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM auth_tokens WHERE hashed_token = ?1 AND is_active = 1"
        ))
        .bind(&hashed)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(Error::InvalidCredential);
        };
        let mut token = row_to_token(&row)?;

        if token.is_expired() {
            return Err(Error::ExpiredCredential);
        }

        let now = now_millis();
        match sqlx::query("UPDATE auth_tokens SET last_used_at = ?2 WHERE token_id = ?1")
            .bind(token.token_id.to_string())
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await
        {
            Ok(_) => token.last_used_at = Some(now),
            Err(e) => {
                warn!(token_id = %token.token_id, error = %e, "Failed to record token use");
            }
        }

        Ok(token)
    }

    /// Look up a token by ID, active or not
    pub async fn get_token_info(&self, token_id: Uuid) -> Result<AuthToken> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM auth_tokens WHERE token_id = ?1"
        ))
        .bind(token_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_token(&row),
            None => Err(Error::NotFound(format!("token {token_id}"))),
        }
    }

    /// List tokens, newest first
    pub async fn list_tokens(
        &self,
        client_name: Option<&str>,
        include_inactive: bool,
    ) -> Result<Vec<AuthToken>> {
        let mut sql = format!("SELECT {COLUMNS} FROM auth_tokens WHERE 1 = 1");
        if client_name.is_some() {
            sql.push_str(" AND client_name = ?1");
        }
        if !include_inactive {
            sql.push_str(" AND is_active = 1");
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut query = sqlx::query(&sql);
        if let Some(name) = client_name {
            query = query.bind(name);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_token).collect()
    }

    /// Soft-delete: the token stops validating but the row is kept
    pub async fn revoke_token(&self, token_id: Uuid) -> Result<()> {
        let result = sqlx::query("UPDATE auth_tokens SET is_active = 0 WHERE token_id = ?1")
            .bind(token_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("token {token_id}")));
        }
        info!(token_id = %token_id, "Revoked service token");
        Ok(())
    }

    /// Remove the row outright
    pub async fn delete_token(&self, token_id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM auth_tokens WHERE token_id = ?1")
            .bind(token_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("token {token_id}")));
        }
        info!(token_id = %token_id, "Deleted service token");
        Ok(())
    }

    /// Replace the stored metadata. No merge with existing keys.
    pub async fn update_token_metadata(
        &self,
        token_id: Uuid,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE auth_tokens SET metadata = ?2 WHERE token_id = ?1")
            .bind(token_id.to_string())
            .bind(serde_json::to_string(metadata)?)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("token {token_id}")));
        }
        debug!(token_id = %token_id, keys = metadata.len(), "Updated token metadata");
        Ok(())
    }

    /// Delete every token whose expiry is in the past
    pub async fn cleanup_expired_tokens(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM auth_tokens WHERE expires_at IS NOT NULL AND expires_at < ?1",
        )
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!(count = removed, "Removed expired service tokens");
        }
        Ok(removed)
    }
}

#[async_trait]
impl TokenValidator for ServiceTokenStore {
    async fn validate_token(&self, raw: &str) -> Result<AuthToken> {
        ServiceTokenStore::validate_token(self, raw).await
    }
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let migrations: &[&str] = &[include_str!("../../migrations/sqlite/001_auth_tokens.sql")];

    for migration_sql in migrations {
        for statement in migration_sql.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(pool).await?;
            }
        }
    }
    Ok(())
}

/// `cdt_` + hex of 32 random bytes
fn generate_raw_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    format!("{TOKEN_PREFIX}{}", hex::encode(bytes))
}

fn row_to_token(row: &SqliteRow) -> Result<AuthToken> {
    let token_id: String = row.try_get("token_id")?;
    let token_id = Uuid::parse_str(&token_id)
        .map_err(|e| Error::Storage(format!("corrupt token id '{token_id}': {e}")))?;
    let metadata: String = row.try_get("metadata")?;
    let is_active: i64 = row.try_get("is_active")?;

    Ok(AuthToken {
        token_id,
        client_name: row.try_get("client_name")?,
        hashed_token: row.try_get("hashed_token")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        expires_at: row
            .try_get::<Option<i64>, _>("expires_at")?
            .map(from_millis)
            .transpose()?,
        last_used_at: row
            .try_get::<Option<i64>, _>("last_used_at")?
            .map(from_millis)
            .transpose()?,
        is_active: is_active != 0,
        metadata: serde_json::from_str(&metadata)?,
    })
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Storage(format!("timestamp out of range: {ms}")))
}

fn truncate_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap_or(t)
}

fn now_millis() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}
