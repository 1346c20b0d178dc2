//! Error kinds surfaced by the document pipeline.
//!
//! The orchestrator does not define HTTP status codes, only error kinds. The
//! calling layer maps `Validation` to a 400-equivalent, `Conflict` to a
//! 409-equivalent, and everything else to a 4xx/5xx with the message.

use thiserror::Error;

/// An error from the OCR/parse pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or invalid input. Never retried; surfaced verbatim.
    #[error("{0}")]
    Validation(String),

    /// The document is already being processed. The caller should re-poll or
    /// re-submit later; we never queue behind an in-flight run.
    #[error("document {0} is already processing")]
    Conflict(i64),

    /// The OCR job reached a terminal FAILED state, or succeeded without
    /// producing anything usable.
    #[error("OCR failed: {0}")]
    RemoteFailure(String),

    /// The polling budget ran out while the job was still in progress.
    #[error("OCR job timed out after {elapsed_secs}s (last status: {last_status})")]
    Timeout {
        elapsed_secs: u64,
        last_status: String,
    },

    /// Anything else, including storage and database failures. Transient
    /// remote errors have already been retried by the time they show up here.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// A short machine-readable kind, written onto failed document records.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::Conflict(_) => "conflict",
            PipelineError::RemoteFailure(_) => "remote_failure",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::Other(_) => "other",
        }
    }
}
