//! Enhancement modes and their SQLite-backed registry.
//!
//! A mode names one enhancement style: the system prompt sent to the
//! provider, the provider itself and an optional model override. The
//! registry keeps modes in a stable order so the UI can cycle through them,
//! and remembers which one the user last selected.

use anyhow::{anyhow, Result};
use r2d2_sqlite::rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::errors::CoreError;
use crate::providers::ProviderKind;

const ACTIVE_MODE_KEY: &str = "enhance.active_mode";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mode {
    pub name: String,
    pub system_prompt: String,
    pub provider: ProviderKind,
    /// Empty means "use the adapter's default model".
    #[serde(default)]
    pub model_name: String,
}

impl Mode {
    pub fn new(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        provider: ProviderKind,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            provider,
            model_name: model_name.into(),
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidMode("name must not be empty".into()));
        }
        if self.system_prompt.trim().is_empty() {
            return Err(CoreError::InvalidMode(format!(
                "mode '{}' has an empty system prompt",
                self.name
            )));
        }
        Ok(())
    }
}

struct BuiltinMode {
    name: &'static str,
    prompt: &'static str,
}

const BUILTIN_MODES: &[BuiltinMode] = &[
    BuiltinMode {
        name: "Enhance",
        prompt: "Improve the clarity and flow of the following text while keeping its meaning and tone. Return only the rewritten text.",
    },
    BuiltinMode {
        name: "Explain",
        prompt: "Explain the following text simply, as if to a curious beginner. Keep it short.",
    },
    BuiltinMode {
        name: "Simplify",
        prompt: "Rewrite the following text using plain, simple words and short sentences. Return only the rewritten text.",
    },
    BuiltinMode {
        name: "Summarize",
        prompt: "Summarize the following text in a few concise sentences.",
    },
    BuiltinMode {
        name: "Fix Grammar",
        prompt: "Correct spelling, grammar and punctuation in the following text. Change nothing else and return only the corrected text.",
    },
];

/// Insert the built-in modes that are not present yet. User edits to a
/// built-in mode survive restarts.
pub fn seed_builtin_modes(conn: &Connection) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    for (position, seed) in BUILTIN_MODES.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO enhancement_modes (name, system_prompt, provider, model_name, position, built_in, created_at, updated_at)
             VALUES (?1, ?2, ?3, '', ?4, 1, ?5, ?5)",
            params![
                seed.name,
                seed.prompt,
                ProviderKind::Gemini.as_str(),
                position as i64,
                now
            ],
        )?;
    }
    Ok(())
}

pub fn list_modes(conn: &Connection) -> Result<Vec<Mode>> {
    let mut stmt = conn.prepare(
        "SELECT name, system_prompt, provider, model_name FROM enhancement_modes ORDER BY position, name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut modes = Vec::new();
    for row in rows {
        let (name, system_prompt, provider, model_name) = row?;
        modes.push(Mode {
            provider: provider.parse()?,
            name,
            system_prompt,
            model_name,
        });
    }
    Ok(modes)
}

pub fn get_mode(conn: &Connection, name: &str) -> Result<Mode> {
    let row = conn
        .query_row(
            "SELECT system_prompt, provider, model_name FROM enhancement_modes WHERE name = ?1",
            params![name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    let (system_prompt, provider, model_name) =
        row.ok_or_else(|| CoreError::ModeNotFound(name.to_string()))?;
    Ok(Mode {
        name: name.to_string(),
        system_prompt,
        provider: provider.parse()?,
        model_name,
    })
}

/// Insert or update a mode. New modes are appended after the existing ones.
pub fn save_mode(conn: &Connection, mode: &Mode) -> Result<()> {
    mode.validate()?;
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let next_position: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position) + 1, 0) FROM enhancement_modes",
        [],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO enhancement_modes (name, system_prompt, provider, model_name, position, built_in, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)
         ON CONFLICT(name) DO UPDATE SET
             system_prompt = excluded.system_prompt,
             provider = excluded.provider,
             model_name = excluded.model_name,
             updated_at = excluded.updated_at",
        params![
            mode.name.trim(),
            mode.system_prompt,
            mode.provider.as_str(),
            mode.model_name.trim(),
            next_position,
            now
        ],
    )?;
    Ok(())
}

pub fn delete_mode(conn: &Connection, name: &str) -> Result<()> {
    let built_in: Option<i64> = conn
        .query_row(
            "SELECT built_in FROM enhancement_modes WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    match built_in {
        None => Err(CoreError::ModeNotFound(name.to_string()).into()),
        Some(flag) if flag != 0 => Err(anyhow!("built-in mode '{name}' cannot be deleted")),
        Some(_) => {
            conn.execute(
                "DELETE FROM enhancement_modes WHERE name = ?1",
                params![name],
            )?;
            if active_mode_name(conn)?.as_deref() == Some(name) {
                conn.execute(
                    "DELETE FROM app_settings WHERE key = ?1",
                    params![ACTIVE_MODE_KEY],
                )?;
            }
            Ok(())
        }
    }
}

pub fn active_mode_name(conn: &Connection) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM app_settings WHERE key = ?1",
            params![ACTIVE_MODE_KEY],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub fn set_active_mode_name(conn: &Connection, name: &str) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![ACTIVE_MODE_KEY, name, now],
    )?;
    Ok(())
}
