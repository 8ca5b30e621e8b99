//! Error types for the `tabula-core` crate.

use thiserror::Error;

/// Errors that can occur in the core data model, pipeline driver, and codec.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A pipeline stage's signal precondition was violated.
    ///
    /// Raised by the pipeline driver's pre-flight check before any stage
    /// mutates the document base, or by a stage that discovers a missing
    /// signal at run time.
    #[error("missing signal '{signal}' on {entity} (required by '{stage}')")]
    MissingSignal {
        /// Description of the entity the signal was expected on.
        entity: String,
        /// Identifier of the missing signal.
        signal: String,
        /// Identifier of the stage whose precondition failed.
        stage: String,
    },

    /// The external embedding provider failed after the permitted retry.
    #[error("embedding failure: {cause}")]
    EmbeddingFailure {
        /// Description of the underlying failure.
        cause: String,
    },

    /// A structural invariant of the document base does not hold.
    #[error("document base consistency violated: {0}")]
    ConsistencyViolation(String),

    /// Encoding or decoding the document base failed.
    #[error("persistence codec failure: {0}")]
    PersistenceError(String),

    /// A resource was requested that the resource manager cannot provide.
    #[error("resource '{0}' is not available")]
    ResourceUnavailable(String),

    /// The user cancelled the running operation.
    ///
    /// Cooperative: the document base is left in its last consistent state
    /// and partial results remain valid.
    #[error("cancelled by the user")]
    UserCancelled,
}

/// A convenience result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
