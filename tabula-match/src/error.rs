//! Error types for the `tabula-match` crate.

use thiserror::Error;

/// Errors that can occur in the matching engine.
#[derive(Debug, Error)]
pub enum MatchError {
    /// The external embedding provider failed.
    #[error("Embedding error ({provider}): {message}")]
    Embedding {
        /// The embedding provider that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// A configuration validation error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An error propagated from `tabula-core`.
    #[error(transparent)]
    Core(#[from] tabula_core::CoreError),
}

impl From<MatchError> for tabula_core::CoreError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::Embedding { provider, message } => {
                tabula_core::CoreError::EmbeddingFailure {
                    cause: format!("{provider}: {message}"),
                }
            }
            MatchError::Config(message) => tabula_core::CoreError::ConsistencyViolation(format!(
                "invalid matcher configuration: {message}"
            )),
            MatchError::Core(core) => core,
        }
    }
}

/// A convenience result type for matching operations.
pub type Result<T> = std::result::Result<T, MatchError>;
