//! Google Gemini adapter (`generateContent`).
//!
//! Gemini receives the system prompt and the user's text as one combined
//! prompt. Safety blocks and early stops are surfaced as provider errors
//! rather than partial text.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{
    build_client, build_combined_prompt, error_message, load_api_key, resolve_model,
    EnhancementProvider, EnhancementResult, ProviderKind,
};
use crate::config::{EnhancerConfig, ProviderEndpoint};
use crate::credentials::CredentialStore;
use crate::errors::EnhanceError;
use crate::modes::Mode;

pub struct GeminiAdapter {
    client: Client,
    endpoint: ProviderEndpoint,
    credentials: Arc<dyn CredentialStore>,
}

impl GeminiAdapter {
    pub fn new(config: &EnhancerConfig, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        let endpoint = config.gemini.clone();
        let client = build_client(&endpoint, &config.user_agent)?;
        Ok(Self {
            client,
            endpoint,
            credentials,
        })
    }

    fn url(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoint.base_url.trim_end_matches('/'),
            model
        )
    }
}

#[async_trait]
impl EnhancementProvider for GeminiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn is_configured(&self) -> bool {
        self.credentials.has_key(ProviderKind::Gemini.credential_key())
    }

    async fn enhance(&self, text: &str, mode: &Mode) -> Result<EnhancementResult, EnhanceError> {
        let api_key = load_api_key(&self.credentials, ProviderKind::Gemini.credential_key()).await?;
        let model = resolve_model(mode, &self.endpoint.default_model);
        let payload = request_body(&mode.system_prompt, text);
        log::debug!("gemini request: mode={} model={}", mode.name, model);

        let started = Instant::now();
        let response = self
            .client
            .post(self.url(&model))
            .header("x-goog-api-key", api_key.expose_secret())
            .json(&payload)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        let elapsed = started.elapsed();

        let (generated, tokens) = interpret_response(status, &body)?;
        Ok(EnhancementResult::new(
            text,
            &generated,
            mode,
            self.label(),
            tokens,
            elapsed,
        ))
    }
}

fn request_body(system_prompt: &str, text: &str) -> Value {
    serde_json::json!({
        "contents": [
            {
                "role": "user",
                "parts": [{"text": build_combined_prompt(system_prompt, text)}]
            }
        ]
    })
}

/// Map an HTTP status and body to generated text plus reported token usage.
pub(crate) fn interpret_response(
    status: u16,
    body: &str,
) -> Result<(String, Option<u32>), EnhanceError> {
    if !(200..300).contains(&status) {
        return Err(map_error_status(status, body));
    }
    if body.trim().is_empty() {
        return Err(EnhanceError::InvalidResponse);
    }
    let json: Value = serde_json::from_str(body).map_err(|_| EnhanceError::InvalidResponse)?;

    if let Some(message) = json
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
    {
        return Err(EnhanceError::ProviderError(message.to_string()));
    }

    if let Some(reason) = json
        .get("promptFeedback")
        .and_then(|f| f.get("blockReason"))
        .and_then(|r| r.as_str())
    {
        return Err(EnhanceError::ProviderError(format!(
            "Content blocked: {reason}"
        )));
    }

    let candidate = json
        .get("candidates")
        .and_then(|c| c.get(0))
        .ok_or(EnhanceError::InvalidResponse)?;

    if let Some(reason) = candidate.get("finishReason").and_then(|r| r.as_str()) {
        if !matches!(reason, "STOP" | "FINISH_REASON_UNSPECIFIED") {
            return Err(EnhanceError::ProviderError(format!(
                "Generation stopped: {reason}"
            )));
        }
    }

    let parts = candidate
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(|parts| parts.as_array())
        .ok_or(EnhanceError::InvalidResponse)?;
    let texts: Vec<&str> = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
        .collect();
    if texts.is_empty() {
        return Err(EnhanceError::InvalidResponse);
    }

    let tokens = json
        .get("usageMetadata")
        .and_then(|u| u.get("totalTokenCount"))
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok());

    Ok((texts.concat(), tokens))
}

fn map_error_status(status: u16, body: &str) -> EnhanceError {
    let message = error_message(body).unwrap_or_else(|| body.trim().chars().take(200).collect());
    let key_rejected = body.contains("API_KEY_INVALID")
        || message.contains("API key not valid")
        || message.contains("API key expired");
    match status {
        401 | 403 => EnhanceError::InvalidCredential,
        400 if key_rejected => EnhanceError::InvalidCredential,
        _ if message.is_empty() => EnhanceError::ProviderError(format!("HTTP {status}")),
        _ => EnhanceError::ProviderError(format!("{status}: {message}")),
    }
}
