//! Provider adapters: one uniform enhancement capability over each external
//! AI HTTP API.

pub mod gemini;
pub mod openai;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ProviderEndpoint;
use crate::credentials::{ApiKey, CredentialKey, CredentialStore};
use crate::errors::{CoreError, EnhanceError};
use crate::modes::Mode;

pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;

/// Fixed prompt used to validate a provider configuration.
pub const PROBE_TEXT: &str = "Say hello";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    OpenAi,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Gemini, ProviderKind::OpenAi];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenAi => "openai",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Gemini => "Gemini",
            Self::OpenAi => "OpenAI",
        }
    }

    pub fn credential_key(&self) -> CredentialKey {
        match self {
            Self::Gemini => CredentialKey::GeminiApiKey,
            Self::OpenAi => CredentialKey::OpenAiApiKey,
        }
    }
}

impl FromStr for ProviderKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gemini" => Ok(Self::Gemini),
            "openai" => Ok(Self::OpenAi),
            other => Err(CoreError::InvalidMode(format!("unknown provider '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnhancementRequest {
    pub original_text: String,
    pub mode: Mode,
}

impl EnhancementRequest {
    pub fn new(original_text: impl Into<String>, mode: Mode) -> Self {
        Self {
            original_text: original_text.into(),
            mode,
        }
    }
}

/// Outcome of one successful enhancement. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnhancementResult {
    original_text: String,
    enhanced_text: String,
    mode_name: String,
    provider_label: String,
    tokens_used: Option<u32>,
    processing_time_seconds: f64,
}

impl EnhancementResult {
    /// Assemble a result from raw provider output. The generated text is
    /// trimmed of surrounding whitespace and newlines.
    pub fn new(
        original_text: &str,
        raw_text: &str,
        mode: &Mode,
        provider_label: &str,
        tokens_used: Option<u32>,
        elapsed: Duration,
    ) -> Self {
        Self {
            original_text: original_text.to_string(),
            enhanced_text: raw_text.trim().to_string(),
            mode_name: mode.name.clone(),
            provider_label: provider_label.to_string(),
            tokens_used,
            processing_time_seconds: elapsed.as_secs_f64(),
        }
    }

    pub fn original_text(&self) -> &str {
        &self.original_text
    }

    pub fn enhanced_text(&self) -> &str {
        &self.enhanced_text
    }

    pub fn mode_name(&self) -> &str {
        &self.mode_name
    }

    pub fn provider_label(&self) -> &str {
        &self.provider_label
    }

    pub fn tokens_used(&self) -> Option<u32> {
        self.tokens_used
    }

    pub fn processing_time_seconds(&self) -> f64 {
        self.processing_time_seconds
    }
}

/// Uniform capability every provider adapter implements.
///
/// `enhance` and `test_connection` either succeed or fail with exactly one
/// [`EnhanceError`]; transport and parsing errors never escape untranslated.
#[async_trait]
pub trait EnhancementProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn label(&self) -> &str {
        self.kind().label()
    }

    /// Whether a credential is stored. Never touches the network, but may
    /// block on the credential store; async callers use `spawn_blocking`.
    fn is_configured(&self) -> bool;

    async fn enhance(&self, text: &str, mode: &Mode) -> Result<EnhancementResult, EnhanceError>;

    /// Send [`PROBE_TEXT`] through the regular enhancement path.
    async fn test_connection(&self) -> Result<bool, EnhanceError> {
        let mode = probe_mode(self.kind());
        self.enhance(PROBE_TEXT, &mode).await.map(|_| true)
    }
}

pub type SharedProvider = Arc<dyn EnhancementProvider>;

pub fn probe_mode(kind: ProviderKind) -> Mode {
    Mode::new("Connection test", "Reply with a short greeting.", kind, "")
}

/// Single-prompt layout for providers without a separate system role.
pub fn build_combined_prompt(system_prompt: &str, text: &str) -> String {
    format!("{system_prompt}\n\nText to process:\n\n{text}")
}

/// Mode-specified model when set, otherwise the adapter default.
pub fn resolve_model(mode: &Mode, default_model: &str) -> String {
    let requested = mode.model_name.trim();
    if requested.is_empty() {
        default_model.to_string()
    } else {
        requested.to_string()
    }
}

/// HTTPS-only client with the endpoint's timeout.
pub(crate) fn build_client(endpoint: &ProviderEndpoint, user_agent: &str) -> anyhow::Result<Client> {
    if !endpoint.base_url.starts_with("https://") {
        anyhow::bail!("refusing non-HTTPS endpoint {}", endpoint.base_url);
    }
    Client::builder()
        .https_only(true)
        .timeout(Duration::from_secs(endpoint.timeout_secs))
        .user_agent(user_agent)
        .build()
        .context("failed to construct HTTP client")
}

/// Read the provider's key off the async executor. A store failure is
/// treated the same as a missing key.
pub(crate) async fn load_api_key(
    store: &Arc<dyn CredentialStore>,
    key: CredentialKey,
) -> Result<ApiKey, EnhanceError> {
    let store = Arc::clone(store);
    let lookup = tokio::task::spawn_blocking(move || store.get(key)).await;
    match lookup {
        Ok(Ok(Some(api_key))) => Ok(api_key),
        Ok(Ok(None)) => Err(EnhanceError::NotConfigured),
        Ok(Err(err)) => {
            log::warn!("credential store read failed for {}: {err}", key.as_str());
            Err(EnhanceError::NotConfigured)
        }
        Err(err) => {
            log::warn!("credential lookup task failed for {}: {err}", key.as_str());
            Err(EnhanceError::NotConfigured)
        }
    }
}

/// Best-effort extraction of `error.message` from a provider error body.
pub(crate) fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(|m| m.to_string())
}
