//! Core library for TaskNote's AI-assisted text enhancement.
//!
//! Module boundaries:
//! - [`providers`] adapts each external AI HTTP API to one enhancement capability.
//! - [`orchestrator`] tracks the current mode and in-flight state and routes requests.
//! - [`errors`] keeps the failure taxonomy with codes and human friendly metadata.
//! - [`credentials`] stores provider API keys.
//! - [`modes`] persists the ordered list of enhancement modes.
//! - [`config`] holds provider endpoints and timeouts.
//! - [`api`] exposes the command surface the UI shell invokes.
//! - [`db`] initialises the SQLite database and applies migrations.
//! - [`logging`] writes structured diagnostics to the event log table.

pub mod api;
pub mod config;
pub mod credentials;
pub mod db;
pub mod errors;
pub mod logging;
pub mod modes;
pub mod orchestrator;
pub mod providers;

pub use errors::{CoreError, EnhanceError};
pub use modes::Mode;
pub use orchestrator::{EnhancementOrchestrator, OrchestratorState};
pub use providers::{EnhancementProvider, EnhancementResult, ProviderKind};
