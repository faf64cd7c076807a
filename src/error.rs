//! Error types for rlm-engine.

use thiserror::Error;

/// Result type alias using rlm-engine's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during RLM operations.
///
/// `NotFound` is deliberately absent: lookups that may legitimately miss
/// (`get_node`, `get_session`, ...) return `Option<T>` instead of this enum.
#[derive(Error, Debug)]
pub enum Error {
    /// A hard budget limit has been exceeded; further work is forbidden
    /// until the caller accepts the attached degradation plan.
    #[error("budget exhausted: {message}")]
    BudgetExhausted { message: String },

    /// Breaker for the given tier is open and rejected the call without
    /// executing it.
    #[error("circuit open for tier {tier}")]
    CircuitOpen { tier: String },

    /// An LLM or embedding provider call failed.
    #[error("provider error: {provider} - {message}")]
    ProviderError { provider: String, message: String },

    /// Invalid argument supplied by the caller (missing label, unknown
    /// subject id, malformed hyperedge). No state was mutated.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// Recursion depth exceeded the Router's configured maximum.
    #[error("maximum recursion depth {max_depth} exceeded")]
    MaxDepthExceeded { max_depth: u32 },

    /// Memory storage (SQLite) error.
    #[error("memory storage error: {0}")]
    MemoryStorage(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport error talking to an LLM or embedding provider.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a budget-exhausted error.
    pub fn budget_exhausted(message: impl Into<String>) -> Self {
        Self::BudgetExhausted {
            message: message.into(),
        }
    }

    /// Create a circuit-open error for the given tier.
    pub fn circuit_open(tier: impl Into<String>) -> Self {
        Self::CircuitOpen { tier: tier.into() }
    }

    /// Create a provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderError {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }

    /// Create a max-depth-exceeded error.
    pub fn max_depth_exceeded(max_depth: u32) -> Self {
        Self::MaxDepthExceeded { max_depth }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::MemoryStorage(err.to_string())
    }
}
