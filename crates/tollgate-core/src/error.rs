use thiserror::Error;

/// A convenience `Result` alias using [`TollgateError`].
pub type TollgateResult<T> = Result<T, TollgateError>;

/// Top-level error type for Tollgate.
///
/// Budget escalation is deliberately absent: it is reported as a result
/// value by the orchestrator, never as an error.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// The document store could not be reached or rejected the operation.
    #[error("Store error: {0}")]
    Store(String),

    /// The message queue could not be reached or rejected the operation.
    #[error("Queue error: {0}")]
    Queue(String),

    /// The sandbox service failed (not the sandboxed code itself).
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// A payload or document failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A document expected to exist was not found.
    #[error("Not found: {collection}/{id}")]
    NotFound {
        /// Collection that was searched.
        collection: String,
        /// Document id.
        id: String,
    },

    /// A task status change violated the lifecycle.
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        /// Entity id.
        id: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// An error from the orchestration engine.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// An error from the worker framework.
    #[error("Worker error: {0}")]
    Worker(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether retrying the failed operation may succeed.
    ///
    /// Backing-service failures are transient. Parse and validation failures
    /// will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            TollgateError::Store(_)
            | TollgateError::Queue(_)
            | TollgateError::Sandbox(_)
            | TollgateError::Io(_)
            | TollgateError::Worker(_)
            | TollgateError::Orchestrator(_) => true,
            TollgateError::Validation(_)
            | TollgateError::Json(_)
            | TollgateError::NotFound { .. }
            | TollgateError::InvalidTransition { .. }
            | TollgateError::Config(_) => false,
        }
    }
}
