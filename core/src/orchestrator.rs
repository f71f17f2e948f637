//! Enhancement orchestrator.
//!
//! Owns the current mode and the in-flight bookkeeping, routes each request
//! to the adapter registered for the mode's provider and records the outcome.
//! Built once at startup and shared by reference; state changes are published
//! on a `watch` channel so the UI can disable its trigger while a request is
//! running.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::config::EnhancerConfig;
use crate::credentials::CredentialStore;
use crate::db::DbPool;
use crate::errors::EnhanceError;
use crate::logging::log_event_detached;
use crate::modes::Mode;
use crate::providers::{
    EnhancementProvider, EnhancementRequest, EnhancementResult, GeminiAdapter, OpenAiAdapter,
    ProviderKind, SharedProvider,
};

/// Snapshot of the orchestrator's observable state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrchestratorState {
    current_mode: Option<Mode>,
    in_flight: usize,
    last_error: Option<EnhanceError>,
}

impl OrchestratorState {
    pub fn current_mode(&self) -> Option<&Mode> {
        self.current_mode.as_ref()
    }

    pub fn is_processing(&self) -> bool {
        self.in_flight > 0
    }

    pub fn last_error(&self) -> Option<&EnhanceError> {
        self.last_error.as_ref()
    }
}

pub struct EnhancementOrchestrator {
    providers: HashMap<ProviderKind, SharedProvider>,
    state: watch::Sender<OrchestratorState>,
    events: Option<DbPool>,
}

impl Default for EnhancementOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl EnhancementOrchestrator {
    /// Empty orchestrator; adapters are added with [`register`](Self::register).
    pub fn new() -> Self {
        let (state, _) = watch::channel(OrchestratorState::default());
        Self {
            providers: HashMap::new(),
            state,
            events: None,
        }
    }

    /// Orchestrator with both HTTP adapters wired to `credentials`.
    pub fn from_config(
        config: &EnhancerConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        let mut orchestrator = Self::new();
        orchestrator.register(Arc::new(GeminiAdapter::new(config, credentials.clone())?));
        orchestrator.register(Arc::new(OpenAiAdapter::new(config, credentials)?));
        Ok(orchestrator)
    }

    /// Record one audit row per completed request in `event_log`.
    pub fn with_event_log(mut self, pool: DbPool) -> Self {
        self.events = Some(pool);
        self
    }

    /// Register (or replace) the adapter for its provider kind.
    pub fn register(&mut self, provider: SharedProvider) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn state(&self) -> OrchestratorState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    pub fn current_mode(&self) -> Option<Mode> {
        self.state.borrow().current_mode.clone()
    }

    pub fn is_processing(&self) -> bool {
        self.state.borrow().is_processing()
    }

    pub fn last_error(&self) -> Option<EnhanceError> {
        self.state.borrow().last_error.clone()
    }

    pub fn select_mode(&self, mode: Mode) {
        self.state.send_modify(|state| state.current_mode = Some(mode));
    }

    /// Advance to the mode after the current one in `modes`, wrapping around.
    /// Selects the first mode when none is current (or the current one is no
    /// longer listed). An empty list leaves the selection untouched.
    pub fn cycle_mode(&self, modes: &[Mode]) -> Option<Mode> {
        if modes.is_empty() {
            return self.current_mode();
        }
        let mut selected = None;
        self.state.send_modify(|state| {
            let position = state
                .current_mode
                .as_ref()
                .and_then(|current| modes.iter().position(|m| m.name == current.name));
            let next = match position {
                Some(index) => modes[(index + 1) % modes.len()].clone(),
                None => modes[0].clone(),
            };
            state.current_mode = Some(next.clone());
            selected = Some(next);
        });
        selected
    }

    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        self.providers
            .get(&kind)
            .map(|provider| provider.is_configured())
            .unwrap_or(false)
    }

    pub fn has_any_provider_configured(&self) -> bool {
        self.providers.values().any(|provider| provider.is_configured())
    }

    /// Probe a provider's configuration. Leaves the orchestrator state alone.
    pub async fn test_connection(&self, kind: ProviderKind) -> Result<bool, EnhanceError> {
        let provider = self
            .configured_provider(kind)
            .await
            .ok_or(EnhanceError::NotConfigured)?;
        provider.test_connection().await
    }

    /// The adapter for `kind` if it has credentials. The credential check may
    /// hit the database, so it runs on the blocking pool.
    async fn configured_provider(&self, kind: ProviderKind) -> Option<SharedProvider> {
        let provider = self.providers.get(&kind)?.clone();
        let probe = provider.clone();
        match tokio::task::spawn_blocking(move || probe.is_configured()).await {
            Ok(true) => Some(provider),
            Ok(false) => None,
            Err(err) => {
                log::warn!("credential check for {} failed: {err}", kind.as_str());
                None
            }
        }
    }

    /// Run one enhancement through the adapter for `mode.provider`.
    ///
    /// `is_processing` is true only while the adapter call is in flight and
    /// is back to false whenever this returns, fails, or is dropped.
    pub async fn enhance(
        &self,
        text: &str,
        mode: &Mode,
    ) -> Result<EnhancementResult, EnhanceError> {
        let Some(provider) = self.configured_provider(mode.provider).await else {
            self.state
                .send_modify(|state| state.last_error = Some(EnhanceError::NotConfigured));
            return Err(EnhanceError::NotConfigured);
        };

        self.state.send_modify(|state| {
            state.in_flight += 1;
            state.last_error = None;
        });

        let request = EnhancementRequest::new(text, mode.clone());
        let task = tokio::spawn(async move {
            provider
                .enhance(&request.original_text, &request.mode)
                .await
        });
        let _busy = BusyGuard {
            state: &self.state,
            task: task.abort_handle(),
        };
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(err) => Err(EnhanceError::NetworkError(err.to_string())),
        };

        match &outcome {
            Ok(result) => {
                log::info!(
                    "enhancement finished: mode={} provider={} seconds={:.2}",
                    result.mode_name(),
                    result.provider_label(),
                    result.processing_time_seconds()
                );
                self.state.send_modify(|state| state.last_error = None);
                self.audit_success(mode, result);
            }
            Err(err) => {
                log::warn!(
                    "enhancement failed: mode={} provider={} code={} error={err}",
                    mode.name,
                    mode.provider.as_str(),
                    err.code()
                );
                self.state
                    .send_modify(|state| state.last_error = Some(err.clone()));
                self.audit_failure(mode, err);
            }
        }
        outcome
    }

    fn audit_success(&self, mode: &Mode, result: &EnhancementResult) {
        if let Some(pool) = &self.events {
            log_event_detached(
                pool,
                "info",
                "ENH-0200",
                "enhance",
                "Text enhancement succeeded",
                json!({
                    "mode": mode.name,
                    "provider": mode.provider.as_str(),
                    "tokens": result.tokens_used(),
                    "seconds": result.processing_time_seconds(),
                }),
            );
        }
    }

    fn audit_failure(&self, mode: &Mode, err: &EnhanceError) {
        if let Some(pool) = &self.events {
            log_event_detached(
                pool,
                "warn",
                "ENH-0201",
                "enhance",
                "Text enhancement failed",
                json!({
                    "mode": mode.name,
                    "provider": mode.provider.as_str(),
                    "code": err.code(),
                    "error": err.to_string(),
                }),
            );
        }
    }
}

/// Ends the in-flight span on every exit path. A dropped future also
/// cancels the adapter task so no request outlives the span.
struct BusyGuard<'a> {
    state: &'a watch::Sender<OrchestratorState>,
    task: AbortHandle,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.task.abort();
        self.state
            .send_modify(|state| state.in_flight = state.in_flight.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::providers::gemini;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread::{self, ThreadId};
    use std::time::Duration;
    use tokio::sync::Notify;

    enum Script {
        /// Canned Gemini HTTP status and body.
        Gemini(u16, &'static str),
        Fail(EnhanceError),
        Panic,
        /// Wait for the notify before answering with the text.
        Gated(Arc<Notify>, &'static str),
        /// Wait for the notify before failing.
        GatedFail(Arc<Notify>, EnhanceError),
    }

    struct ScriptedProvider {
        kind: ProviderKind,
        configured: bool,
        script: Script,
        calls: AtomicUsize,
        completions: AtomicUsize,
        checked_on: Mutex<Option<ThreadId>>,
    }

    impl ScriptedProvider {
        fn new(kind: ProviderKind, configured: bool, script: Script) -> Arc<Self> {
            Arc::new(Self {
                kind,
                configured,
                script,
                calls: AtomicUsize::new(0),
                completions: AtomicUsize::new(0),
                checked_on: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl EnhancementProvider for ScriptedProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn is_configured(&self) -> bool {
            *self.checked_on.lock().unwrap() = Some(thread::current().id());
            self.configured
        }

        async fn enhance(
            &self,
            text: &str,
            mode: &Mode,
        ) -> Result<EnhancementResult, EnhanceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Gemini(status, body) => {
                    let (generated, tokens) = gemini::interpret_response(*status, body)?;
                    Ok(EnhancementResult::new(
                        text,
                        &generated,
                        mode,
                        self.label(),
                        tokens,
                        Duration::from_millis(5),
                    ))
                }
                Script::Fail(err) => Err(err.clone()),
                Script::Panic => panic!("adapter bug"),
                Script::Gated(gate, reply) => {
                    gate.notified().await;
                    self.completions.fetch_add(1, Ordering::SeqCst);
                    Ok(EnhancementResult::new(
                        text,
                        reply,
                        mode,
                        self.label(),
                        None,
                        Duration::from_millis(5),
                    ))
                }
                Script::GatedFail(gate, err) => {
                    gate.notified().await;
                    self.completions.fetch_add(1, Ordering::SeqCst);
                    Err(err.clone())
                }
            }
        }
    }

    fn explain_mode() -> Mode {
        Mode::new("Explain", "Explain simply.", ProviderKind::Gemini, "")
    }

    fn orchestrator_with(provider: Arc<ScriptedProvider>) -> EnhancementOrchestrator {
        let mut orchestrator = EnhancementOrchestrator::new();
        orchestrator.register(provider);
        orchestrator
    }

    const EXPLAIN_BODY: &str = r#"{"candidates":[{"content":{"parts":[{"text":" Energy equals mass times speed of light squared.\n"}]},"finishReason":"STOP"}]}"#;

    #[tokio::test]
    async fn explain_scenario_returns_trimmed_text() {
        let provider = ScriptedProvider::new(
            ProviderKind::Gemini,
            true,
            Script::Gemini(200, EXPLAIN_BODY),
        );
        let orchestrator = orchestrator_with(provider.clone());

        let result = orchestrator.enhance("E=mc^2", &explain_mode()).await.unwrap();
        assert_eq!(
            result.enhanced_text(),
            "Energy equals mass times speed of light squared."
        );
        assert_eq!(result.mode_name(), "Explain");
        assert_eq!(result.original_text(), "E=mc^2");
        assert_eq!(result.provider_label(), "Gemini");
        assert!(!orchestrator.is_processing());
        assert_eq!(orchestrator.last_error(), None);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_credential_fails_without_going_busy() {
        let provider = ScriptedProvider::new(
            ProviderKind::Gemini,
            false,
            Script::Gemini(200, EXPLAIN_BODY),
        );
        let orchestrator = orchestrator_with(provider.clone());
        let mut updates = orchestrator.subscribe();

        let err = orchestrator.enhance("E=mc^2", &explain_mode()).await.unwrap_err();
        assert_eq!(err, EnhanceError::NotConfigured);
        assert_eq!(orchestrator.last_error(), Some(EnhanceError::NotConfigured));
        assert!(!updates.borrow_and_update().is_processing());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unregistered_provider_is_not_configured() {
        let orchestrator = EnhancementOrchestrator::new();
        let mode = Mode::new("Rewrite", "Rewrite.", ProviderKind::OpenAi, "");
        assert_eq!(
            orchestrator.enhance("text", &mode).await.unwrap_err(),
            EnhanceError::NotConfigured
        );
        assert!(!orchestrator.has_any_provider_configured());
    }

    #[tokio::test]
    async fn safety_block_is_recorded_and_propagated() {
        let provider = ScriptedProvider::new(
            ProviderKind::Gemini,
            true,
            Script::Gemini(200, r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#),
        );
        let orchestrator = orchestrator_with(provider);

        let err = orchestrator.enhance("E=mc^2", &explain_mode()).await.unwrap_err();
        match &err {
            EnhanceError::ProviderError(reason) => assert!(reason.contains("SAFETY")),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(orchestrator.last_error(), Some(err));
        assert!(!orchestrator.is_processing());
    }

    #[tokio::test]
    async fn invalid_response_is_not_a_network_error() {
        let provider = ScriptedProvider::new(
            ProviderKind::Gemini,
            true,
            Script::Gemini(200, r#"{"candidates":[{"content":{"parts":[{}]}}]}"#),
        );
        let orchestrator = orchestrator_with(provider);
        assert_eq!(
            orchestrator.enhance("x", &explain_mode()).await.unwrap_err(),
            EnhanceError::InvalidResponse
        );
    }

    #[tokio::test]
    async fn adapter_panic_becomes_network_error() {
        let provider = ScriptedProvider::new(ProviderKind::Gemini, true, Script::Panic);
        let orchestrator = orchestrator_with(provider);

        let err = orchestrator.enhance("x", &explain_mode()).await.unwrap_err();
        assert!(matches!(err, EnhanceError::NetworkError(_)), "{err:?}");
        assert!(!orchestrator.is_processing());
        assert_eq!(orchestrator.last_error(), Some(err));
    }

    #[tokio::test]
    async fn success_clears_previous_error() {
        let failing = ScriptedProvider::new(
            ProviderKind::OpenAi,
            true,
            Script::Fail(EnhanceError::NetworkError("connection reset".into())),
        );
        let working = ScriptedProvider::new(
            ProviderKind::Gemini,
            true,
            Script::Gemini(200, EXPLAIN_BODY),
        );
        let mut orchestrator = EnhancementOrchestrator::new();
        orchestrator.register(failing);
        orchestrator.register(working);

        let rest_mode = Mode::new("Rewrite", "Rewrite.", ProviderKind::OpenAi, "");
        assert!(orchestrator.enhance("x", &rest_mode).await.is_err());
        assert!(orchestrator.last_error().is_some());

        orchestrator.enhance("E=mc^2", &explain_mode()).await.unwrap();
        assert_eq!(orchestrator.last_error(), None);
    }

    #[tokio::test]
    async fn processing_flag_spans_the_request() {
        let gate = Arc::new(Notify::new());
        let provider = ScriptedProvider::new(
            ProviderKind::Gemini,
            true,
            Script::Gated(gate.clone(), "done\n"),
        );
        let orchestrator = Arc::new(orchestrator_with(provider));
        let mut updates = orchestrator.subscribe();

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.enhance("x", &explain_mode()).await })
        };
        updates.wait_for(|state| state.is_processing()).await.unwrap();
        assert!(orchestrator.is_processing());

        gate.notify_one();
        let result = running.await.unwrap().unwrap();
        assert_eq!(result.enhanced_text(), "done");
        assert!(!orchestrator.is_processing());
    }

    #[tokio::test]
    async fn dropped_request_does_not_stay_busy() {
        let gate = Arc::new(Notify::new());
        let provider = ScriptedProvider::new(
            ProviderKind::Gemini,
            true,
            Script::Gated(gate.clone(), "never"),
        );
        let orchestrator = orchestrator_with(provider.clone());

        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            orchestrator.enhance("x", &explain_mode()),
        )
        .await;
        assert!(outcome.is_err());
        assert!(!orchestrator.is_processing());

        // The adapter task was cancelled with the request.
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.completions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn last_call_to_finish_decides_last_error() {
        let fail_gate = Arc::new(Notify::new());
        let ok_gate = Arc::new(Notify::new());
        let failing = ScriptedProvider::new(
            ProviderKind::OpenAi,
            true,
            Script::GatedFail(
                fail_gate.clone(),
                EnhanceError::NetworkError("connection reset".into()),
            ),
        );
        let working = ScriptedProvider::new(
            ProviderKind::Gemini,
            true,
            Script::Gated(ok_gate.clone(), "done"),
        );
        let mut orchestrator = EnhancementOrchestrator::new();
        orchestrator.register(failing.clone());
        orchestrator.register(working.clone());
        let orchestrator = Arc::new(orchestrator);

        let rewrite = Mode::new("Rewrite", "Rewrite.", ProviderKind::OpenAi, "");
        let first = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.enhance("a", &rewrite).await })
        };
        let second = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.enhance("b", &explain_mode()).await })
        };
        while failing.calls.load(Ordering::SeqCst) == 0 || working.calls.load(Ordering::SeqCst) == 0
        {
            tokio::task::yield_now().await;
        }

        fail_gate.notify_one();
        assert!(first.await.unwrap().is_err());
        assert!(orchestrator.is_processing());
        assert_eq!(
            orchestrator.last_error(),
            Some(EnhanceError::NetworkError("connection reset".into()))
        );

        ok_gate.notify_one();
        second.await.unwrap().unwrap();
        assert!(!orchestrator.is_processing());
        assert_eq!(orchestrator.last_error(), None);
    }

    #[tokio::test]
    async fn credential_check_runs_off_the_async_thread() {
        let provider = ScriptedProvider::new(
            ProviderKind::Gemini,
            true,
            Script::Gemini(200, EXPLAIN_BODY),
        );
        let orchestrator = orchestrator_with(provider.clone());
        orchestrator.enhance("E=mc^2", &explain_mode()).await.unwrap();

        let checked_on = provider.checked_on.lock().unwrap().unwrap();
        assert_ne!(checked_on, thread::current().id());
    }

    #[tokio::test]
    async fn audit_rows_are_written_when_enabled() {
        let pool = memory_pool().unwrap();
        let provider = ScriptedProvider::new(
            ProviderKind::Gemini,
            true,
            Script::Gemini(200, EXPLAIN_BODY),
        );
        let orchestrator = orchestrator_with(provider).with_event_log(pool.clone());
        orchestrator.enhance("E=mc^2", &explain_mode()).await.unwrap();

        let mut count = 0i64;
        for _ in 0..50 {
            let conn = pool.get().unwrap();
            count = conn
                .query_row(
                    "SELECT COUNT(1) FROM event_log WHERE code = 'ENH-0200'",
                    [],
                    |row| row.get(0),
                )
                .unwrap();
            drop(conn);
            if count > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count, 1);
    }

    fn modes(names: &[&str]) -> Vec<Mode> {
        names
            .iter()
            .map(|name| Mode::new(*name, "Prompt.", ProviderKind::Gemini, ""))
            .collect()
    }

    #[test]
    fn cycle_mode_has_period_n() {
        let orchestrator = EnhancementOrchestrator::new();
        let list = modes(&["Enhance", "Explain", "Simplify"]);

        let visited: Vec<String> = (0..list.len())
            .map(|_| orchestrator.cycle_mode(&list).unwrap().name)
            .collect();
        assert_eq!(visited, vec!["Enhance", "Explain", "Simplify"]);
        assert_eq!(orchestrator.cycle_mode(&list).unwrap().name, "Enhance");
    }

    #[test]
    fn cycle_mode_on_empty_list_is_noop() {
        let orchestrator = EnhancementOrchestrator::new();
        assert_eq!(orchestrator.cycle_mode(&[]), None);

        orchestrator.select_mode(explain_mode());
        assert_eq!(orchestrator.cycle_mode(&[]), Some(explain_mode()));
        assert_eq!(orchestrator.current_mode(), Some(explain_mode()));
    }

    #[test]
    fn cycle_mode_restarts_when_current_is_unlisted() {
        let orchestrator = EnhancementOrchestrator::new();
        orchestrator.select_mode(Mode::new("Gone", "Prompt.", ProviderKind::Gemini, ""));
        let list = modes(&["A", "B"]);
        assert_eq!(orchestrator.cycle_mode(&list).unwrap().name, "A");
    }

    #[test]
    fn configuration_queries_do_not_mutate() {
        let mut orchestrator = EnhancementOrchestrator::new();
        orchestrator.register(ScriptedProvider::new(
            ProviderKind::OpenAi,
            true,
            Script::Fail(EnhanceError::InvalidResponse),
        ));
        let before = orchestrator.state();
        assert!(orchestrator.is_configured(ProviderKind::OpenAi));
        assert!(!orchestrator.is_configured(ProviderKind::Gemini));
        assert!(orchestrator.has_any_provider_configured());
        assert_eq!(orchestrator.state(), before);
    }

    #[tokio::test]
    async fn test_connection_reports_adapter_outcome() {
        let mut orchestrator = EnhancementOrchestrator::new();
        orchestrator.register(ScriptedProvider::new(
            ProviderKind::Gemini,
            true,
            Script::Gemini(200, EXPLAIN_BODY),
        ));
        orchestrator.register(ScriptedProvider::new(
            ProviderKind::OpenAi,
            true,
            Script::Fail(EnhanceError::InvalidCredential),
        ));
        assert_eq!(orchestrator.test_connection(ProviderKind::Gemini).await, Ok(true));
        assert_eq!(
            orchestrator.test_connection(ProviderKind::OpenAi).await,
            Err(EnhanceError::InvalidCredential)
        );
        assert_eq!(orchestrator.last_error(), None);
    }
}
