// src/storage/mod.rs
//! Postgres-backed persistence. All write paths are transactional; dedup is
//! enforced by unique constraints and surfaced as expected outcomes, never as
//! errors. Runtime `sqlx::query` only, no compile-time database.

pub mod images;
pub mod news;
pub mod outbox;
pub mod refdata;
mod schema;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{News, OutboxEvent, ParserState};

pub use images::{prepare_image, NewImage, PreparedImage};
pub use schema::init_schema;

/// Outcome of an atomic news insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    DuplicateOnHash,
    DuplicateOnExternalId,
}

/// Write seam between the ingest pipeline and the store; the concrete
/// implementation is `news::NewsRepository`, tests substitute memory fakes.
#[async_trait]
pub trait NewsWriter: Send + Sync {
    async fn insert_news(
        &self,
        news: &News,
        images: &[NewImage],
        outbox: &OutboxEvent,
    ) -> PipelineResult<InsertOutcome>;

    async fn unenriched_backlog(&self) -> PipelineResult<u64>;

    async fn save_parser_state(&self, source_id: Uuid, state: &ParserState) -> PipelineResult<()>;

    async fn set_source_enabled(&self, source_id: Uuid, enabled: bool) -> PipelineResult<()>;
}

/// Best-effort media downloader used while ingesting; a failed fetch skips
/// the image, never the news item.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Option<NewImage>;
}

/// No-op fetcher for sources without media and for tests.
pub struct NoMedia;

#[async_trait]
impl MediaFetcher for NoMedia {
    async fn fetch(&self, _url: &str) -> Option<NewImage> {
        None
    }
}

pub struct HttpMediaFetcher {
    client: reqwest::Client,
}

impl HttpMediaFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str) -> Option<NewImage> {
        let resp = self.client.get(url).send().await.ok()?.error_for_status().ok()?;
        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .split(';')
            .next()
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = resp.bytes().await.ok()?.to_vec();
        Some(NewImage { bytes, mime_type: mime })
    }
}

/// Open the pool. Unreachable storage is fatal at startup (exit code 2).
pub async fn connect(cfg: &StorageConfig) -> PipelineResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .connect(&cfg.database_url)
        .await
        .map_err(|e| PipelineError::TransientIo(format!("connecting postgres: {e}")))
}

/// Map a unique-constraint violation to its constraint name.
pub(crate) fn unique_violation(e: &sqlx::Error) -> Option<String> {
    if let sqlx::Error::Database(db) = e {
        if db.code().as_deref() == Some("23505") {
            return Some(db.constraint().unwrap_or_default().to_string());
        }
    }
    None
}
