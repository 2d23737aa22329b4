//! Core error taxonomy
//!
//! One typed error for everything that crosses a component boundary.
//! Non-fatal gateway codes and single-provider failures are recovered
//! locally and never reach callers as `CoreError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Request rejected before any I/O. Maps to HTTP 400.
    #[error("validation: {0}")]
    Validation(String),

    /// No response within the configured bound. For orders this is surfaced
    /// as a "Submitted (timeout)" status, not an error.
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Gateway unreachable after repeated backoff.
    #[error("session unavailable: {0}")]
    SessionUnavailable(String),

    /// The live session dropped while a request was pending.
    #[error("session dropped")]
    SessionDropped,

    /// A fatal gateway error code. Non-fatal codes are swallowed upstream.
    #[error("gateway error {code}: {message}")]
    Gateway { code: i32, message: String },

    /// One scoring provider failed. Never fatal to the ensemble while at
    /// least one other provider succeeded.
    #[error("provider {provider} failed: {cause}")]
    ProviderFailure { provider: String, cause: String },

    /// Provider returned data outside the schema (score out of [0,100],
    /// confidence outside [0,1], ...). Aggregated like a provider failure.
    #[error("provider {provider} schema mismatch: {detail}")]
    SchemaMismatch { provider: String, detail: String },

    /// Every provider failed or was non-compliant.
    #[error("no scoring providers available")]
    NoProvidersAvailable,

    /// Scoring fan-out throttle is saturated.
    #[error("evaluation throttle saturated ({max} in flight)")]
    ThrottleSaturated { max: usize },

    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn provider(provider: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::ProviderFailure {
            provider: provider.into(),
            cause: cause.to_string(),
        }
    }

    /// True when the error should surface as HTTP 400 rather than 500.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
