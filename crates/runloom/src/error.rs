//! Error types for runloom.

use thiserror::Error;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error type accepted from user code (handlers, step bodies,
/// middleware, hooks).
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur in runloom operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid registration or request parameters.
    ///
    /// Raised synchronously before anything is persisted: duplicate step ids,
    /// invalid cron expressions, schema rejections, empty step lists.
    #[error("validation error: {0}")]
    Validation(String),

    /// A record does not exist, or the supplied resource id does not match.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Failed to serialize or deserialize run/queue payload data.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// PostgreSQL storage error.
    ///
    /// Preserves the full `sqlx::Error` for matching on specific database
    /// error conditions (connection timeout, constraint violation, etc.).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Workflow id was not registered.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// Workflow id was registered more than once.
    #[error("duplicate workflow registration: {0}")]
    DuplicateWorkflow(String),

    /// Cron expression or timezone failed to parse.
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron {
        /// The offending expression.
        expression: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A step body raised an error during a dispatch.
    ///
    /// The run row has already been marked FAILED with the message when this
    /// surfaces; the dispatcher decides whether a retry follows.
    #[error("step {step_id} failed for run {run_id}: {message}")]
    StepFailed {
        /// The step whose body raised.
        step_id: String,
        /// The run being dispatched.
        run_id: String,
        /// Message and cause chain of the raised error.
        message: String,
    },

    /// A run reached terminal FAILED after exhausting its retries.
    #[error("workflow {workflow_id} run {run_id} failed: {cause}")]
    RunFailed {
        /// The workflow definition id.
        workflow_id: String,
        /// The failed run.
        run_id: String,
        /// Message of the final failure.
        cause: String,
    },
}

impl Error {
    /// Returns `true` when the underlying database error is a unique
    /// violation on the named constraint.
    pub(crate) fn is_unique_violation(&self, constraint: &str) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db)) => {
                db.constraint() == Some(constraint)
            }
            _ => false,
        }
    }
}

/// Render an error with its source chain, outermost first.
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
