//! Terminal task errors

use key_pool::ErrorKind;
use transport::ApiError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// No credential could be selected before any attempt was made.
    #[error(transparent)]
    Pool(#[from] key_pool::Error),

    #[error("failed to read source: {0}")]
    Source(#[from] std::io::Error),

    /// Rejected before any request was sent.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("compression failed after {attempts} attempt(s) ({kind}): {source}")]
    Failed {
        attempts: u32,
        kind: ErrorKind,
        #[source]
        source: ApiError,
    },

    #[error("task cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            PipelineError::Failed { kind, .. } => Some(*kind),
            PipelineError::InvalidTask(_) => Some(ErrorKind::ClientError),
            _ => None,
        }
    }

    /// HTTP status of the last underlying failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            PipelineError::Failed { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Label for the task outcome metric.
    pub fn outcome(&self) -> &'static str {
        match self {
            PipelineError::Pool(_) => "pool_exhausted",
            PipelineError::Source(_) | PipelineError::InvalidTask(_) => "invalid",
            PipelineError::Failed { .. } => "failed",
            PipelineError::Cancelled => "cancelled",
        }
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
