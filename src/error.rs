// src/error.rs
// Crate-wide error type for the pipeline's user-visible boundary.
//
// Leaf components return `anyhow::Result<T>` (matching the teacher's
// `memory`/`llm` modules); the orchestrator downcasts/maps into
// `PipelineError` at the point a response is produced, the same split the
// teacher draws between `git::error::GitError` and ad hoc `anyhow::Context`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("upstream service error: {0}")]
    Upstream(String),

    #[error("embedding invalid: {0}")]
    EmbeddingInvalid(String),

    #[error("index stale for {kind}/{id}: {reason}")]
    IndexStale {
        kind: String,
        id: String,
        reason: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// §7: unhandled internal errors convert to `Internal` at the orchestrator
    /// boundary. Used when an `anyhow::Error` crosses from a leaf component
    /// into user-visible territory without a more specific mapping.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<PipelineError>() {
            Ok(typed) => typed,
            Err(err) => Self::Internal(err.to_string()),
        }
    }

    /// §7: user-visible operations always return 200 with a friendly message;
    /// `NotFound`/`Validation`/`Conflict` use a canonical template here,
    /// `Upstream`/`Timeout` are rendered by the Generator (C12) instead.
    pub fn canonical_user_message(&self) -> Option<String> {
        match self {
            Self::NotFound(what) => Some(format!("I couldn't find {what}.")),
            Self::Validation(what) => Some(format!("That request isn't valid: {what}")),
            Self::Conflict(what) => Some(format!("That conflicts with existing data: {what}")),
            _ => None,
        }
    }
}

pub trait IntoPipelineError<T> {
    fn pipeline_context(self, context: &str) -> PipelineResult<T>;
}

impl<T, E: std::fmt::Display> IntoPipelineError<T> for Result<T, E> {
    fn pipeline_context(self, context: &str) -> PipelineResult<T> {
        self.map_err(|e| PipelineError::Internal(format!("{context}: {e}")))
    }
}
