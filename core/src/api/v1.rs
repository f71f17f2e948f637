//! Version 1 of the command API.
//!
//! Commands are thin wrappers that resolve modes from the registry, run the
//! orchestrator and return JSON-friendly payloads. Errors carry a stable code
//! and a `needs_setup` flag so the UI can send the user to credential setup
//! instead of showing a generic failure.

use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;

use crate::config;
use crate::credentials::{CredentialStore, SqliteCredentialStore};
use crate::db::DbPool;
use crate::errors::{CoreError, EnhanceError};
use crate::logging::log_event;
use crate::modes::{self, Mode};
use crate::orchestrator::EnhancementOrchestrator;
use crate::providers::{EnhancementResult, ProviderKind};

/// Shared state handed to every command.
#[derive(Clone)]
pub struct ApiState {
    pub db: DbPool,
    pub orchestrator: Arc<EnhancementOrchestrator>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl ApiState {
    /// Wire the SQLite-backed credential store and both adapters, then
    /// restore the last selected mode.
    pub fn initialise(db: DbPool) -> anyhow::Result<Self> {
        let conn = db.get()?;
        let enhancer_config = config::load_config(&conn)?;
        drop(conn);
        let credentials: Arc<dyn CredentialStore> =
            Arc::new(SqliteCredentialStore::new(db.clone()));
        let orchestrator = EnhancementOrchestrator::from_config(&enhancer_config, credentials.clone())?
            .with_event_log(db.clone());
        Self::with_parts(db, orchestrator, credentials)
    }

    pub fn with_parts(
        db: DbPool,
        orchestrator: EnhancementOrchestrator,
        credentials: Arc<dyn CredentialStore>,
    ) -> anyhow::Result<Self> {
        let conn = db.get()?;
        if let Some(name) = modes::active_mode_name(&conn)? {
            match modes::get_mode(&conn, &name) {
                Ok(mode) => orchestrator.select_mode(mode),
                Err(err) => log::warn!("stored active mode '{name}' is unavailable: {err}"),
            }
        }
        drop(conn);
        Ok(Self {
            db,
            orchestrator: Arc::new(orchestrator),
            credentials,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub explain: String,
    pub needs_setup: bool,
}

impl From<EnhanceError> for ApiError {
    fn from(err: EnhanceError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            explain: err.explain().to_string(),
            needs_setup: err.needs_credentials(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let (code, explain) = match err.downcast_ref::<CoreError>() {
            Some(core) => (core.code(), core.explain()),
            None => (CoreError::Unknown.code(), CoreError::Unknown.explain()),
        };
        Self {
            code: code.to_string(),
            message: err.to_string(),
            explain: explain.to_string(),
            needs_setup: false,
        }
    }
}

impl From<r2d2::Error> for ApiError {
    fn from(err: r2d2::Error) -> Self {
        let core = CoreError::DbUnavailable;
        Self {
            code: core.code().to_string(),
            message: err.to_string(),
            explain: core.explain().to_string(),
            needs_setup: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateView {
    pub current_mode: Option<Mode>,
    pub is_processing: bool,
    pub last_error: Option<ApiError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderStatusView {
    pub provider: ProviderKind,
    pub label: String,
    pub configured: bool,
}

#[derive(Debug, Deserialize)]
pub struct EnhanceInput {
    pub text: String,
    /// Mode name; the current mode (or the first registered one) when absent.
    pub mode: Option<String>,
}

/// Run one enhancement.
pub async fn enhance_text(
    state: &ApiState,
    input: EnhanceInput,
) -> Result<EnhancementResult, ApiError> {
    let mode = match input.mode {
        Some(name) => {
            let pool = state.db.clone();
            spawn_blocking(move || {
                let conn = pool.get()?;
                modes::get_mode(&conn, &name)
            })
            .await
            .map_err(|err| anyhow!(err.to_string()))??
        }
        None => match state.orchestrator.current_mode() {
            Some(mode) => mode,
            None => {
                let pool = state.db.clone();
                let first = spawn_blocking(move || {
                    let conn = pool.get()?;
                    Ok::<_, anyhow::Error>(modes::list_modes(&conn)?.into_iter().next())
                })
                .await
                .map_err(|err| anyhow!(err.to_string()))??;
                let mode = first.ok_or_else(|| anyhow!("no enhancement modes are registered"))?;
                state.orchestrator.select_mode(mode.clone());
                mode
            }
        },
    };
    Ok(state.orchestrator.enhance(&input.text, &mode).await?)
}

pub fn list_modes(state: &ApiState) -> Result<Vec<Mode>, ApiError> {
    let conn = state.db.get()?;
    Ok(modes::list_modes(&conn)?)
}

/// Make `name` the current mode and remember it across restarts.
pub fn select_mode(state: &ApiState, name: &str) -> Result<Mode, ApiError> {
    let conn = state.db.get()?;
    let mode = modes::get_mode(&conn, name)?;
    state.orchestrator.select_mode(mode.clone());
    modes::set_active_mode_name(&conn, &mode.name)?;
    Ok(mode)
}

pub fn cycle_mode(state: &ApiState) -> Result<Option<Mode>, ApiError> {
    let conn = state.db.get()?;
    let available = modes::list_modes(&conn)?;
    let selected = state.orchestrator.cycle_mode(&available);
    if let Some(mode) = &selected {
        modes::set_active_mode_name(&conn, &mode.name)?;
    }
    Ok(selected)
}

pub fn current_state(state: &ApiState) -> StateView {
    let snapshot = state.orchestrator.state();
    StateView {
        current_mode: snapshot.current_mode().cloned(),
        is_processing: snapshot.is_processing(),
        last_error: snapshot.last_error().cloned().map(ApiError::from),
    }
}

pub fn provider_status(state: &ApiState) -> Vec<ProviderStatusView> {
    ProviderKind::ALL
        .iter()
        .map(|kind| ProviderStatusView {
            provider: *kind,
            label: kind.label().to_string(),
            configured: state.orchestrator.is_configured(*kind),
        })
        .collect()
}

/// Store (or, with a blank value, clear) the API key for `provider`.
pub fn save_api_key(
    state: &ApiState,
    provider: ProviderKind,
    api_key: &str,
) -> Result<ProviderStatusView, ApiError> {
    state.credentials.save(provider.credential_key(), api_key)?;
    audit_credentials(state, provider, "API key updated");
    Ok(status_of(state, provider))
}

pub fn delete_api_key(
    state: &ApiState,
    provider: ProviderKind,
) -> Result<ProviderStatusView, ApiError> {
    state.credentials.delete(provider.credential_key())?;
    audit_credentials(state, provider, "API key removed");
    Ok(status_of(state, provider))
}

pub async fn test_connection(state: &ApiState, provider: ProviderKind) -> Result<bool, ApiError> {
    Ok(state.orchestrator.test_connection(provider).await?)
}

fn status_of(state: &ApiState, provider: ProviderKind) -> ProviderStatusView {
    ProviderStatusView {
        provider,
        label: provider.label().to_string(),
        configured: state.orchestrator.is_configured(provider),
    }
}

fn audit_credentials(state: &ApiState, provider: ProviderKind, message: &str) {
    match state.db.get() {
        Ok(conn) => {
            if let Err(err) = log_event(
                &conn,
                "info",
                Some("ENH-0001"),
                "enhance.credentials",
                message,
                Some("Provider credential changed"),
                Some(serde_json::json!({ "provider": provider.as_str() })),
            ) {
                log::warn!("failed to write event log row ENH-0001: {err}");
            }
        }
        Err(err) => log::warn!("event log unavailable: {err}"),
    }
}
