//! Error taxonomy for the pipeline.
//!
//! Every component maps its failures onto `PipelineError`; stages then branch
//! on `disposition()` instead of matching error variants directly, so retry /
//! skip / degrade policy lives in one place.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("malformed input item: {0}")]
    DataValidation(String),

    #[error("duplicate content hash")]
    DuplicateOnHash,

    #[error("duplicate (source_id, external_id)")]
    DuplicateOnExternalId,

    #[error("downstream component rejected: {0}")]
    Downstream(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("shutdown requested")]
    Cancelled,
}

/// What the caller should do with a failed unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Abort startup / the whole process.
    Fatal,
    /// Retry with backoff inside the owning component.
    Retry,
    /// Drop the single item, count it, continue.
    Skip,
    /// Expected outcome, not an error (dedup hits).
    Expected,
    /// Retry a bounded number of times, then persist a failed state and move on.
    Degrade,
    /// Surface to the operator and pause the source.
    Pause,
    /// Graceful cancellation; unwind without logging an error.
    Cancelled,
}

impl PipelineError {
    pub fn disposition(&self) -> Disposition {
        match self {
            PipelineError::Config(_) => Disposition::Fatal,
            PipelineError::TransientIo(_) => Disposition::Retry,
            PipelineError::NotFound(_) => Disposition::Skip,
            PipelineError::DataValidation(_) => Disposition::Skip,
            PipelineError::DuplicateOnHash | PipelineError::DuplicateOnExternalId => {
                Disposition::Expected
            }
            PipelineError::Downstream(_) => Disposition::Degrade,
            PipelineError::Unauthorized(_) => Disposition::Pause,
            PipelineError::Cancelled => Disposition::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.disposition(),
            Disposition::Retry | Disposition::Degrade
        )
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => PipelineError::NotFound("row not found".into()),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                PipelineError::TransientIo(e.to_string())
            }
            _ => PipelineError::Downstream(format!("db: {e}")),
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            PipelineError::TransientIo(e.to_string())
        } else if let Some(status) = e.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                PipelineError::TransientIo(format!("http {status}"))
            } else if status.as_u16() == 401 || status.as_u16() == 403 {
                PipelineError::Unauthorized(format!("http {status}"))
            } else if status.as_u16() == 404 {
                PipelineError::NotFound(format!("http {status}"))
            } else {
                PipelineError::Downstream(format!("http {status}"))
            }
        } else {
            PipelineError::Downstream(e.to_string())
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispositions_match_taxonomy() {
        assert_eq!(
            PipelineError::Config("x".into()).disposition(),
            Disposition::Fatal
        );
        assert_eq!(
            PipelineError::TransientIo("x".into()).disposition(),
            Disposition::Retry
        );
        assert_eq!(
            PipelineError::DuplicateOnHash.disposition(),
            Disposition::Expected
        );
        assert_eq!(
            PipelineError::Downstream("x".into()).disposition(),
            Disposition::Degrade
        );
        assert_eq!(PipelineError::Cancelled.disposition(), Disposition::Cancelled);
    }

    #[test]
    fn duplicates_are_not_retryable() {
        assert!(!PipelineError::DuplicateOnHash.is_retryable());
        assert!(PipelineError::TransientIo("503".into()).is_retryable());
    }
}
