//! OpenAI-compatible chat completions adapter.
//!
//! Unlike Gemini this API has native roles, so the mode's system prompt goes
//! into the `system` message and the user's text into the `user` message.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{
    build_client, error_message, load_api_key, resolve_model, EnhancementProvider,
    EnhancementResult, ProviderKind,
};
use crate::config::{EnhancerConfig, ProviderEndpoint};
use crate::credentials::CredentialStore;
use crate::errors::EnhanceError;
use crate::modes::Mode;

const TEMPERATURE: f64 = 0.3;

pub struct OpenAiAdapter {
    client: Client,
    endpoint: ProviderEndpoint,
    credentials: Arc<dyn CredentialStore>,
}

impl OpenAiAdapter {
    pub fn new(config: &EnhancerConfig, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        let endpoint = config.openai.clone();
        let client = build_client(&endpoint, &config.user_agent)?;
        Ok(Self {
            client,
            endpoint,
            credentials,
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.endpoint.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl EnhancementProvider for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn is_configured(&self) -> bool {
        self.credentials.has_key(ProviderKind::OpenAi.credential_key())
    }

    async fn enhance(&self, text: &str, mode: &Mode) -> Result<EnhancementResult, EnhanceError> {
        let api_key = load_api_key(&self.credentials, ProviderKind::OpenAi.credential_key()).await?;
        let model = resolve_model(mode, &self.endpoint.default_model);
        let payload = request_body(&model, &mode.system_prompt, text);
        log::debug!("openai request: mode={} model={}", mode.name, model);

        let started = Instant::now();
        let response = self
            .client
            .post(self.url())
            .bearer_auth(api_key.expose_secret())
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

fn request_body(model: &str, system_prompt: &str, text: &str) -> Value {
    serde_json::json!({
        "model": model,
        "messages": [
            {"role": "system", "content": system_prompt},
            {"role": "user", "content": text},
        ],
        "temperature": TEMPERATURE,
    })
}

pub(crate) fn interpret_response(
    status: u16,
    body: &str,
) -> Result<(String, Option<u32>), EnhanceError> {
    if !(200..300).contains(&status) {
        return Err(match status {
            401 | 403 => EnhanceError::InvalidCredential,
            _ => match error_message(body) {
                Some(message) => EnhanceError::ProviderError(format!("{status}: {message}")),
                None => EnhanceError::ProviderError(format!("HTTP {status}")),
            },
        });
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

    let choice = json
        .get("choices")
        .and_then(|choices| choices.get(0))
        .ok_or(EnhanceError::InvalidResponse)?;

    if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
        if matches!(reason, "length" | "content_filter") {
            return Err(EnhanceError::ProviderError(format!(
                "Generation stopped: {reason}"
            )));
        }
    }

    let content = choice
        .get("message")
        .and_then(|msg| msg.get("content"))
        .and_then(|val| val.as_str())
        .ok_or(EnhanceError::InvalidResponse)?;

    let tokens = json
        .get("usage")
        .and_then(|usage| usage.get("total_tokens"))
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok());

    Ok((content.to_string(), tokens))
}
