use serde::Serialize;
use thiserror::Error;

/// Failure kinds shared by every provider adapter and the orchestrator.
///
/// An adapter call either succeeds or fails with exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum EnhanceError {
    #[error("No API key is configured for this provider")]
    NotConfigured,
    #[error("The provider rejected the API key")]
    InvalidCredential,
    #[error("The provider returned a response that could not be read")]
    InvalidResponse,
    #[error("Provider error: {0}")]
    ProviderError(String),
    #[error("Network error: {0}")]
    NetworkError(String),
}

impl EnhanceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotConfigured => "ENH-1001",
            Self::InvalidCredential => "ENH-1002",
            Self::InvalidResponse => "ENH-1003",
            Self::ProviderError(_) => "ENH-1004",
            Self::NetworkError(_) => "ENH-1005",
        }
    }

    pub fn explain(&self) -> &'static str {
        match self {
            Self::NotConfigured => "Add an API key for the provider used by this mode.",
            Self::InvalidCredential => {
                "The stored API key is malformed or revoked. Replace it in settings."
            }
            Self::InvalidResponse => {
                "The provider answered without the expected text. Its API may have changed."
            }
            Self::ProviderError(_) => "The provider refused or could not finish the request.",
            Self::NetworkError(_) => "The provider could not be reached. Try again later.",
        }
    }

    /// True when the user has to fix the credential before anything else.
    pub fn needs_credentials(&self) -> bool {
        matches!(self, Self::NotConfigured | Self::InvalidCredential)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkError(_))
    }
}

impl From<reqwest::Error> for EnhanceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::NetworkError(format!("request timed out: {err}"));
        }
        Self::NetworkError(err.to_string())
    }
}

/// Errors raised by the persistence side (mode registry, settings).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Database unavailable")]
    DbUnavailable,
    #[error("Mode not found: {0}")]
    ModeNotFound(String),
    #[error("Invalid mode: {0}")]
    InvalidMode(String),
    #[error("Unknown error")]
    Unknown,
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DbUnavailable => "DB-1001",
            Self::ModeNotFound(_) => "MOD-1001",
            Self::InvalidMode(_) => "MOD-1002",
            Self::Unknown => "GEN-1000",
        }
    }

    pub fn explain(&self) -> &'static str {
        match self {
            Self::DbUnavailable => "The application could not access the SQLite database.",
            Self::ModeNotFound(_) => "No enhancement mode exists with the requested name.",
            Self::InvalidMode(_) => "The mode is missing a name or a system prompt.",
            Self::Unknown => "An unspecified error occurred.",
        }
    }
}
