// src/storage/news.rs
//! News repository: atomic ingest writes (news + images + outbox in one
//! transaction), claim-and-lock iteration for enrichment workers, and the
//! event queries the causal engine feeds on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::SourceEntry;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{
    EnrichmentStatus, Entity, Event, EventAttrs, LinkedCompany, News, OutboxEvent, ParserState,
    Source, SourceKind, Topic,
};
use crate::storage::{prepare_image, InsertOutcome, NewImage, NewsWriter};

#[derive(Clone)]
pub struct NewsRepository {
    pool: PgPool,
}

impl NewsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // -- sources ------------------------------------------------------------

    /// Insert or refresh a source from the config entry. Parser state is
    /// never touched here; it belongs to the polling task.
    pub async fn upsert_source(&self, entry: &SourceEntry) -> PipelineResult<Source> {
        let kind = entry
            .kind()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        let display_name = entry.display_name.clone().unwrap_or_else(|| entry.code.clone());
        let row = sqlx::query(
            r#"
            INSERT INTO sources (id, code, kind, display_name, base_locator, trust_level, enabled, config)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (code) DO UPDATE SET
                kind = EXCLUDED.kind,
                display_name = EXCLUDED.display_name,
                base_locator = EXCLUDED.base_locator,
                trust_level = EXCLUDED.trust_level,
                enabled = EXCLUDED.enabled,
                config = EXCLUDED.config
            RETURNING id, code, kind, display_name, base_locator, trust_level, enabled, config,
                      last_external_id, last_poll_at, error_count, backfill_completed
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&entry.code)
        .bind(kind.as_str())
        .bind(&display_name)
        .bind(&entry.locator)
        .bind(entry.trust_level as i16)
        .bind(entry.enabled)
        .bind(&entry.config)
        .fetch_one(&self.pool)
        .await?;
        source_from_row(&row)
    }

    pub async fn enabled_sources(&self) -> PipelineResult<Vec<Source>> {
        let rows = sqlx::query(
            r#"
            SELECT id, code, kind, display_name, base_locator, trust_level, enabled, config,
                   last_external_id, last_poll_at, error_count, backfill_completed
            FROM sources WHERE enabled ORDER BY code
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    pub async fn mark_backfill_completed(&self, source_id: Uuid) -> PipelineResult<()> {
        sqlx::query("UPDATE sources SET backfill_completed = TRUE WHERE id = $1")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- ingest -------------------------------------------------------------

    async fn insert_news_tx(
        &self,
        news: &News,
        images: &[NewImage],
        outbox: &OutboxEvent,
    ) -> Result<InsertOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Fast pre-checks keep the common duplicate path cheap; the unique
        // constraints still decide races.
        let hash_hit: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM news WHERE content_hash = $1")
                .bind(&news.content_hash)
                .fetch_optional(&mut *tx)
                .await?;
        if hash_hit.is_some() {
            return Ok(InsertOutcome::DuplicateOnHash);
        }
        let ext_hit: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM news WHERE source_id = $1 AND external_id = $2")
                .bind(news.source_id)
                .bind(&news.external_id)
                .fetch_optional(&mut *tx)
                .await?;
        if ext_hit.is_some() {
            return Ok(InsertOutcome::DuplicateOnExternalId);
        }

        sqlx::query(
            r#"
            INSERT INTO news (id, source_id, external_id, title, text_body, summary,
                              published_at, detected_at, url, lang, content_hash,
                              is_ad, ad_score, ad_reasons, enrichment_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(news.id)
        .bind(news.source_id)
        .bind(&news.external_id)
        .bind(&news.title)
        .bind(&news.text)
        .bind(&news.summary)
        .bind(news.published_at)
        .bind(news.detected_at)
        .bind(&news.url)
        .bind(&news.lang)
        .bind(&news.content_hash)
        .bind(news.is_ad)
        .bind(news.ad_score)
        .bind(serde_json::to_value(&news.ad_reasons).unwrap_or_default())
        .bind(news.enrichment_status.as_str())
        .execute(&mut *tx)
        .await?;

        for img in images {
            let Some(prepared) = prepare_image(img) else {
                continue;
            };
            sqlx::query(
                r#"
                INSERT INTO images (id, sha256, mime_type, width, height, file_size, bytes, thumbnail)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (sha256) DO NOTHING
                "#,
            )
            .bind(prepared.id)
            .bind(&prepared.sha256)
            .bind(&prepared.mime_type)
            .bind(prepared.width.map(|w| w as i32))
            .bind(prepared.height.map(|h| h as i32))
            .bind(prepared.file_size as i32)
            .bind(&prepared.bytes)
            .bind(&prepared.thumbnail)
            .execute(&mut *tx)
            .await?;

            // The digest owner may be a pre-existing row; link to whichever won.
            let image_id: Uuid = sqlx::query_scalar("SELECT id FROM images WHERE sha256 = $1")
                .bind(&prepared.sha256)
                .fetch_one(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO news_images (news_id, image_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(news.id)
            .bind(image_id)
            .execute(&mut *tx)
            .await?;
        }

        insert_outbox_row(&mut tx, outbox).await?;

        tx.commit().await?;
        Ok(InsertOutcome::Inserted)
    }

    // -- enrichment claim/complete -------------------------------------------

    /// Claim up to `batch` unenriched, non-ad rows using skip-locked semantics
    /// so concurrent workers never double-claim.
    pub async fn claim_unenriched(&self, batch: u32) -> PipelineResult<Vec<News>> {
        let rows = sqlx::query(
            r#"
            UPDATE news SET enrichment_status = 'in_progress'
            WHERE id IN (
                SELECT id FROM news
                WHERE enrichment_status = 'pending' AND is_ad = FALSE
                ORDER BY detected_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, source_id, external_id, title, text_body, summary, published_at,
                      detected_at, url, lang, content_hash, is_ad, ad_score, ad_reasons,
                      enrichment_status
            "#,
        )
        .bind(batch as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(news_from_row).collect()
    }

    /// Crash recovery: return claimed-but-unfinished rows to the queue.
    pub async fn release_stale_claims(&self) -> PipelineResult<u64> {
        let res = sqlx::query(
            "UPDATE news SET enrichment_status = 'pending' WHERE enrichment_status = 'in_progress'",
        )
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    pub async fn mark_enriched(
        &self,
        news_id: Uuid,
        summary: Option<&str>,
        status: EnrichmentStatus,
    ) -> PipelineResult<()> {
        sqlx::query(
            "UPDATE news SET enrichment_status = $2, summary = COALESCE($3, summary) WHERE id = $1",
        )
        .bind(news_id)
        .bind(status.as_str())
        .bind(summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replace all enrichment artifacts of a news item in one transaction.
    /// Re-running enrichment on the same news is a no-op in effect: old rows
    /// go away, identical new ones come back.
    pub async fn replace_enrichment(
        &self,
        news_id: Uuid,
        entities: &[Entity],
        linked: &[LinkedCompany],
        topics: &[Topic],
        events: &[Event],
        outbox_events: &[OutboxEvent],
    ) -> PipelineResult<()> {
        let mut tx = self.pool.begin().await?;

        for table in ["entities", "linked_companies", "topics", "events"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE news_id = $1"))
                .bind(news_id)
                .execute(&mut *tx)
                .await?;
        }

        for e in entities {
            sqlx::query(
                r#"
                INSERT INTO entities (id, news_id, kind, raw_text, normalized, confidence, attrs)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(e.news_id)
            .bind(e.kind.as_str())
            .bind(&e.raw_text)
            .bind(&e.normalized)
            .bind(e.confidence)
            .bind(&e.attrs)
            .execute(&mut *tx)
            .await?;
        }

        for lc in linked {
            sqlx::query(
                r#"
                INSERT INTO linked_companies (news_id, issuer_id, ticker, method, score, is_primary)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (news_id, issuer_id) DO UPDATE SET
                    score = EXCLUDED.score, method = EXCLUDED.method, is_primary = EXCLUDED.is_primary
                "#,
            )
            .bind(lc.news_id)
            .bind(lc.issuer_id)
            .bind(&lc.ticker)
            .bind(lc.method.as_str())
            .bind(lc.score)
            .bind(lc.is_primary)
            .execute(&mut *tx)
            .await?;
        }

        for t in topics {
            sqlx::query(
                r#"
                INSERT INTO topics (news_id, code, confidence, is_primary)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (news_id, code) DO UPDATE SET
                    confidence = EXCLUDED.confidence, is_primary = EXCLUDED.is_primary
                "#,
            )
            .bind(t.news_id)
            .bind(&t.code)
            .bind(t.confidence)
            .bind(t.is_primary)
            .execute(&mut *tx)
            .await?;
        }

        for ev in events {
            sqlx::query(
                r#"
                INSERT INTO events (id, news_id, event_type, title, ts, attrs, is_anchor, confidence)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(ev.id)
            .bind(ev.news_id)
            .bind(&ev.event_type)
            .bind(&ev.title)
            .bind(ev.ts)
            .bind(serde_json::to_value(&ev.attrs).unwrap_or_default())
            .bind(ev.is_anchor)
            .bind(ev.confidence)
            .execute(&mut *tx)
            .await?;
        }

        for ob in outbox_events {
            insert_outbox_row(&mut tx, ob).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Outbox insert outside an enrichment transaction (edge/impact events
    /// computed after the main commit).
    pub async fn insert_outbox(&self, ob: &OutboxEvent) -> PipelineResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_outbox_row(&mut tx, ob).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_event_importance(&self, event_id: Uuid, score: f64) -> PipelineResult<()> {
        sqlx::query("UPDATE events SET importance = $2 WHERE id = $1")
            .bind(event_id)
            .bind(score)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- event queries for the causal engine ---------------------------------

    /// Past events inside the lookback window, newest first, with the body
    /// text of their parent news (needed for causal text markers).
    pub async fn recent_events_with_text(
        &self,
        since: DateTime<Utc>,
        exclude_news: Uuid,
        limit: i64,
    ) -> PipelineResult<Vec<(Event, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.news_id, e.event_type, e.title, e.ts, e.attrs, e.is_anchor, e.confidence,
                   n.title AS n_title, n.text_body AS n_text
            FROM events e JOIN news n ON n.id = e.news_id
            WHERE e.ts >= $1 AND e.news_id <> $2
            ORDER BY e.ts DESC
            LIMIT $3
            "#,
        )
        .bind(since)
        .bind(exclude_news)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_with_text_from_row).collect()
    }

    /// Events after `from` up to `until`, oldest first (retroactive pass).
    pub async fn future_events_with_text(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        exclude_news: Uuid,
        limit: i64,
    ) -> PipelineResult<Vec<(Event, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.news_id, e.event_type, e.title, e.ts, e.attrs, e.is_anchor, e.confidence,
                   n.title AS n_title, n.text_body AS n_text
            FROM events e JOIN news n ON n.id = e.news_id
            WHERE e.ts > $1 AND e.ts <= $2 AND e.news_id <> $3
            ORDER BY e.ts
            LIMIT $4
            "#,
        )
        .bind(from)
        .bind(until)
        .bind(exclude_news)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_with_text_from_row).collect()
    }

    /// Events strictly between two instants (evidence candidates).
    pub async fn events_between(
        &self,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
        limit: i64,
    ) -> PipelineResult<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT id, news_id, event_type, title, ts, attrs, is_anchor, confidence
            FROM events WHERE ts > $1 AND ts < $2 ORDER BY ts LIMIT $3
            "#,
        )
        .bind(after)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    // -- stats / search -------------------------------------------------------

    pub async fn unenriched_count(&self) -> PipelineResult<u64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM news WHERE enrichment_status = 'pending' AND is_ad = FALSE",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(n.max(0) as u64)
    }

    pub async fn status_counts(&self) -> PipelineResult<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT enrichment_status, COUNT(*) FROM news GROUP BY enrichment_status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Filtered full-text search over stored news. Every filter is a
    /// parameter with an "empty = off" guard so the statement shape stays
    /// stable and cacheable.
    pub async fn search(
        &self,
        query: Option<&str>,
        ticker: Option<&str>,
        date_from: Option<DateTime<Utc>>,
        exclude_ads: bool,
        limit: i64,
    ) -> PipelineResult<Vec<News>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT n.id, n.source_id, n.external_id, n.title, n.text_body, n.summary,
                   n.published_at, n.detected_at, n.url, n.lang, n.content_hash, n.is_ad,
                   n.ad_score, n.ad_reasons, n.enrichment_status
            FROM news n
            LEFT JOIN linked_companies lc ON lc.news_id = n.id
            WHERE (NOT $1 OR n.is_ad = FALSE)
              AND ($2 = ''
                   OR to_tsvector('russian', n.title || ' ' || n.text_body)
                      @@ plainto_tsquery('russian', $2))
              AND ($3 = '' OR lc.ticker = $3)
              AND n.published_at >= $4
            ORDER BY n.published_at DESC
            LIMIT $5
            "#,
        )
        .bind(exclude_ads)
        .bind(query.unwrap_or(""))
        .bind(ticker.unwrap_or(""))
        .bind(date_from.unwrap_or(DateTime::UNIX_EPOCH))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(news_from_row).collect()
    }
}

#[async_trait]
impl NewsWriter for NewsRepository {
    async fn insert_news(
        &self,
        news: &News,
        images: &[NewImage],
        outbox: &OutboxEvent,
    ) -> PipelineResult<InsertOutcome> {
        match self.insert_news_tx(news, images, outbox).await {
            Ok(outcome) => Ok(outcome),
            // Concurrent writers may both pass the pre-check; the constraint
            // settles it and the loser reports the duplicate outcome.
            Err(e) => match crate::storage::unique_violation(&e).as_deref() {
                Some("news_content_hash_key") => Ok(InsertOutcome::DuplicateOnHash),
                Some("news_source_external_key") => Ok(InsertOutcome::DuplicateOnExternalId),
                _ => Err(e.into()),
            },
        }
    }

    async fn unenriched_backlog(&self) -> PipelineResult<u64> {
        self.unenriched_count().await
    }

    async fn save_parser_state(&self, source_id: Uuid, state: &ParserState) -> PipelineResult<()> {
        sqlx::query(
            r#"
            UPDATE sources SET last_external_id = $2, last_poll_at = $3,
                               error_count = $4, backfill_completed = $5
            WHERE id = $1
            "#,
        )
        .bind(source_id)
        .bind(&state.last_external_id)
        .bind(state.last_poll_at)
        .bind(state.error_count as i32)
        .bind(state.backfill_completed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_source_enabled(&self, source_id: Uuid, enabled: bool) -> PipelineResult<()> {
        sqlx::query("UPDATE sources SET enabled = $2 WHERE id = $1")
            .bind(source_id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub(crate) async fn insert_outbox_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ob: &OutboxEvent,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO outbox (id, topic, payload, status, retries, next_attempt_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(ob.id)
    .bind(&ob.topic)
    .bind(&ob.payload)
    .bind(ob.status.as_str())
    .bind(ob.retries as i32)
    .bind(ob.next_attempt_at)
    .bind(ob.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// -- row mapping -------------------------------------------------------------

fn source_from_row(row: &PgRow) -> PipelineResult<Source> {
    let kind_str: String = row.try_get("kind").map_err(sqlx_field)?;
    let kind = SourceKind::parse(&kind_str)
        .ok_or_else(|| PipelineError::DataValidation(format!("bad source kind `{kind_str}`")))?;
    Ok(Source {
        id: row.try_get("id").map_err(sqlx_field)?,
        code: row.try_get("code").map_err(sqlx_field)?,
        kind,
        display_name: row.try_get("display_name").map_err(sqlx_field)?,
        base_locator: row.try_get("base_locator").map_err(sqlx_field)?,
        trust_level: row.try_get::<i16, _>("trust_level").map_err(sqlx_field)? as u8,
        enabled: row.try_get("enabled").map_err(sqlx_field)?,
        config: row.try_get("config").map_err(sqlx_field)?,
        parser_state: ParserState {
            last_external_id: row.try_get("last_external_id").map_err(sqlx_field)?,
            last_poll_at: row.try_get("last_poll_at").map_err(sqlx_field)?,
            error_count: row.try_get::<i32, _>("error_count").map_err(sqlx_field)? as u32,
            backfill_completed: row.try_get("backfill_completed").map_err(sqlx_field)?,
        },
    })
}

fn news_from_row(row: &PgRow) -> PipelineResult<News> {
    let status_str: String = row.try_get("enrichment_status").map_err(sqlx_field)?;
    let status = EnrichmentStatus::parse(&status_str).ok_or_else(|| {
        PipelineError::DataValidation(format!("bad enrichment status `{status_str}`"))
    })?;
    let ad_reasons: serde_json::Value = row.try_get("ad_reasons").map_err(sqlx_field)?;
    Ok(News {
        id: row.try_get("id").map_err(sqlx_field)?,
        source_id: row.try_get("source_id").map_err(sqlx_field)?,
        external_id: row.try_get("external_id").map_err(sqlx_field)?,
        title: row.try_get("title").map_err(sqlx_field)?,
        text: row.try_get("text_body").map_err(sqlx_field)?,
        summary: row.try_get("summary").map_err(sqlx_field)?,
        published_at: row.try_get("published_at").map_err(sqlx_field)?,
        detected_at: row.try_get("detected_at").map_err(sqlx_field)?,
        url: row.try_get("url").map_err(sqlx_field)?,
        lang: row.try_get("lang").map_err(sqlx_field)?,
        content_hash: row
            .try_get::<String, _>("content_hash")
            .map_err(sqlx_field)?
            .trim()
            .to_string(),
        is_ad: row.try_get("is_ad").map_err(sqlx_field)?,
        ad_score: row.try_get("ad_score").map_err(sqlx_field)?,
        ad_reasons: serde_json::from_value(ad_reasons).unwrap_or_default(),
        enrichment_status: status,
    })
}

fn event_from_row(row: &PgRow) -> PipelineResult<Event> {
    let attrs_json: serde_json::Value = row.try_get("attrs").map_err(sqlx_field)?;
    let attrs: EventAttrs = serde_json::from_value(attrs_json).unwrap_or_default();
    Ok(Event {
        id: row.try_get("id").map_err(sqlx_field)?,
        news_id: row.try_get("news_id").map_err(sqlx_field)?,
        event_type: row.try_get("event_type").map_err(sqlx_field)?,
        title: row.try_get("title").map_err(sqlx_field)?,
        ts: row.try_get("ts").map_err(sqlx_field)?,
        attrs,
        is_anchor: row.try_get("is_anchor").map_err(sqlx_field)?,
        confidence: row.try_get("confidence").map_err(sqlx_field)?,
    })
}

fn event_with_text_from_row(row: &PgRow) -> PipelineResult<(Event, String)> {
    let event = event_from_row(row)?;
    let title: String = row.try_get("n_title").map_err(sqlx_field)?;
    let body: String = row.try_get("n_text").map_err(sqlx_field)?;
    Ok((event, format!("{title} {body}")))
}

fn sqlx_field(e: sqlx::Error) -> PipelineError {
    PipelineError::DataValidation(format!("row decode: {e}"))
}
