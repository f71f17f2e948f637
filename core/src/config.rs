//! Provider endpoint configuration, persisted as JSON in `app_settings`.

use anyhow::{anyhow, Result};
use r2d2_sqlite::rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::providers::ProviderKind;

const CONFIG_KEY: &str = "enhance.config";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub default_model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancerConfig {
    pub user_agent: String,
    pub gemini: ProviderEndpoint,
    pub openai: ProviderEndpoint,
}

impl Default for EnhancerConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("TaskNote-Core/{}", env!("CARGO_PKG_VERSION")),
            gemini: ProviderKind::Gemini.default_endpoint(),
            openai: ProviderKind::OpenAi.default_endpoint(),
        }
    }
}

impl ProviderKind {
    pub fn default_endpoint(&self) -> ProviderEndpoint {
        match self {
            ProviderKind::Gemini => ProviderEndpoint {
                base_url: "https://generativelanguage.googleapis.com".into(),
                default_model: "gemini-2.0-flash".into(),
                timeout_secs: 30,
            },
            ProviderKind::OpenAi => ProviderEndpoint {
                base_url: "https://api.openai.com".into(),
                default_model: "gpt-4o-mini".into(),
                timeout_secs: 60,
            },
        }
    }
}

impl EnhancerConfig {
    pub fn endpoint(&self, kind: ProviderKind) -> &ProviderEndpoint {
        match kind {
            ProviderKind::Gemini => &self.gemini,
            ProviderKind::OpenAi => &self.openai,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for kind in ProviderKind::ALL {
            let endpoint = self.endpoint(kind);
            if !endpoint.base_url.starts_with("https://") {
                return Err(anyhow!(
                    "{} endpoint must use https: {}",
                    kind.label(),
                    endpoint.base_url
                ));
            }
            if endpoint.timeout_secs == 0 {
                return Err(anyhow!("{} timeout must be positive", kind.label()));
            }
            if endpoint.default_model.trim().is_empty() {
                return Err(anyhow!("{} default model must be set", kind.label()));
            }
        }
        Ok(())
    }
}

/// Read the stored configuration, falling back to defaults field by field.
pub fn load_config(conn: &Connection) -> Result<EnhancerConfig> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM app_settings WHERE key = ?1",
            params![CONFIG_KEY],
            |row| row.get(0),
        )
        .optional()?;
    match value {
        Some(raw) => {
            let mut merged = serde_json::to_value(EnhancerConfig::default())?;
            merge_json(&mut merged, serde_json::from_str(&raw)?);
            let config: EnhancerConfig = serde_json::from_value(merged)?;
            config.validate()?;
            Ok(config)
        }
        None => Ok(EnhancerConfig::default()),
    }
}

fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

pub fn save_config(conn: &Connection, config: &EnhancerConfig) -> Result<()> {
    config.validate()?;
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let payload = serde_json::to_string(config)?;
    conn.execute(
        "INSERT INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![CONFIG_KEY, payload, now],
    )?;
    Ok(())
}
