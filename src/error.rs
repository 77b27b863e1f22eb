//! Error types for flagbandit.

use thiserror::Error;

use crate::repository::RepositoryError;
use crate::sandbox::SandboxError;

/// Errors that can occur when building or operating the decision engine.
///
/// Evaluation and feedback paths never return these; they degrade to
/// "no decision" instead. These surface from construction, state loading,
/// flushing and registration.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error extracting configuration from figment.
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A collaborator repository failed.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// The sandbox rejected or failed to run a custom algorithm.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// A required collaborator was not supplied to the builder.
    #[error("missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    /// Algorithm slug is not one of the built-in algorithms.
    #[error("unknown algorithm slug: {0}")]
    UnknownAlgorithm(String),

    /// Registration targets a feature that does not match the algorithm shape.
    #[error("invalid registration for {feature}/{environment}: {reason}")]
    InvalidRegistration {
        feature: String,
        environment: String,
        reason: String,
    },

    /// Error spawning the background flush thread.
    #[error("failed to spawn flush thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
