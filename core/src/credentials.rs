//! API key storage.
//!
//! Providers only ever see the [`CredentialStore`] capability. The SQLite
//! store keeps keys base64-encoded in the `ai_credentials` table; the memory
//! store backs tests and ephemeral sessions.

use std::collections::HashMap;
use std::fmt;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as B64_ENGINE;
use base64::Engine;
use r2d2_sqlite::rusqlite::{params, OptionalExtension};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use time::OffsetDateTime;

use crate::db::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKey {
    GeminiApiKey,
    OpenAiApiKey,
}

impl CredentialKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeminiApiKey => "gemini_api_key",
            Self::OpenAiApiKey => "openai_api_key",
        }
    }
}

/// An API key that never shows up in `Debug` output.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::from(key.into()))
    }

    /// Only call this when the key is about to be sent to a provider.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey([REDACTED])")
    }
}

pub trait CredentialStore: Send + Sync {
    fn get(&self, key: CredentialKey) -> Result<Option<ApiKey>>;

    /// Store a secret. Saving an empty (or whitespace-only) value removes it.
    fn save(&self, key: CredentialKey, value: &str) -> Result<()>;

    fn delete(&self, key: CredentialKey) -> Result<()>;

    fn has_key(&self, key: CredentialKey) -> bool {
        matches!(self.get(key), Ok(Some(_)))
    }
}

pub struct SqliteCredentialStore {
    pool: DbPool,
}

impl SqliteCredentialStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn get(&self, key: CredentialKey) -> Result<Option<ApiKey>> {
        let conn = self.pool.get()?;
        let secret: Option<String> = conn
            .query_row(
                "SELECT secret FROM ai_credentials WHERE key_id = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(encoded) = secret else {
            return Ok(None);
        };
        let decoded = B64_ENGINE
            .decode(encoded.as_bytes())
            .map_err(|_| anyhow!("Failed to decode stored credential"))?;
        let value = String::from_utf8(decoded)
            .map_err(|_| anyhow!("Stored credential was not valid UTF-8"))?;
        Ok(Some(ApiKey::new(value)))
    }

    fn save(&self, key: CredentialKey, value: &str) -> Result<()> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return self.delete(key);
        }
        let conn = self.pool.get()?;
        let encoded = B64_ENGINE.encode(trimmed.as_bytes());
        let now = OffsetDateTime::now_utc().unix_timestamp();
        conn.execute(
            "INSERT INTO ai_credentials (key_id, secret, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(key_id) DO UPDATE SET secret = excluded.secret, updated_at = excluded.updated_at",
            params![key.as_str(), encoded, now],
        )?;
        log::debug!("stored credential {}", key.as_str());
        Ok(())
    }

    fn delete(&self, key: CredentialKey) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM ai_credentials WHERE key_id = ?1",
            params![key.as_str()],
        )?;
        log::debug!("deleted credential {}", key.as_str());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    secrets: RwLock<HashMap<CredentialKey, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(self, key: CredentialKey, value: &str) -> Self {
        if let Ok(mut secrets) = self.secrets.write() {
            secrets.insert(key, value.to_string());
        }
        self
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: CredentialKey) -> Result<Option<ApiKey>> {
        let secrets = self
            .secrets
            .read()
            .map_err(|_| anyhow!("credential store lock poisoned"))?;
        Ok(secrets.get(&key).map(|v| ApiKey::new(v.clone())))
    }

    fn save(&self, key: CredentialKey, value: &str) -> Result<()> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return self.delete(key);
        }
        self.secrets
            .write()
            .map_err(|_| anyhow!("credential store lock poisoned"))?
            .insert(key, trimmed.to_string());
        Ok(())
    }

    fn delete(&self, key: CredentialKey) -> Result<()> {
        self.secrets
            .write()
            .map_err(|_| anyhow!("credential store lock poisoned"))?
            .remove(&key);
        Ok(())
    }
}
