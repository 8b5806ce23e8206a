// src/ingest/types.rs
use async_trait::async_trait;
use thiserror::Error;

use crate::antispam::ItemShape;
use crate::model::{RawNews, Source};

/// One fetched item: the uniform news record plus transport-level facts the
/// antispam scorer wants (urls, hashtags, forward origin).
#[derive(Debug, Clone)]
pub struct FetchedItem {
    pub raw: RawNews,
    pub shape: ItemShape,
}

/// Result of a single poll call.
#[derive(Debug, Clone, Default)]
pub struct PollBatch {
    /// Items in published-at order (best effort).
    pub items: Vec<FetchedItem>,
    /// Cursor to persist after a successful flush; `None` = unchanged.
    pub new_cursor: Option<String>,
    /// Items the adapter skipped as malformed (logged, counted).
    pub malformed: usize,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Channel/page gone or never existed; retried a bounded number of times,
    /// then the source is marked unhealthy.
    #[error("source target not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Rate limit / transient HTTP; retried with exponential backoff.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// The whole response was unusable (not a single parseable item).
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }

    pub fn from_http(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            return AdapterError::Transient(e.to_string());
        }
        match e.status() {
            Some(s) if s.as_u16() == 404 => AdapterError::NotFound(format!("http {s}")),
            Some(s) if s.as_u16() == 401 || s.as_u16() == 403 => {
                AdapterError::Unauthorized(format!("http {s}"))
            }
            Some(s) if s.is_server_error() || s.as_u16() == 429 => {
                AdapterError::Transient(format!("http {s}"))
            }
            Some(s) => AdapterError::Malformed(format!("http {s}")),
            None => AdapterError::Transient(e.to_string()),
        }
    }
}

/// A pull adapter for one kind of source. One instance serves every source of
/// its kind; per-source state lives in `Source::parser_state` and is owned by
/// the polling task.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Fetch items newer than `cursor`, oldest first.
    async fn poll(&self, source: &Source, cursor: Option<&str>) -> Result<PollBatch, AdapterError>;

    /// Fetch historical items back to `horizon_days` (already capped by the
    /// caller). Runs concurrently with live polling; dedup resolves overlap.
    async fn backfill(
        &self,
        source: &Source,
        horizon_days: i64,
    ) -> Result<Vec<FetchedItem>, AdapterError>;

    fn name(&self) -> &'static str;
}
