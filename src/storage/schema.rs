// src/storage/schema.rs
//! Schema bootstrap. Idempotent: every statement is `IF NOT EXISTS`, safe to
//! run on every startup.

use sqlx::PgPool;

use crate::error::PipelineResult;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sources (
        id                  UUID PRIMARY KEY,
        code                TEXT NOT NULL UNIQUE,
        kind                TEXT NOT NULL,
        display_name        TEXT NOT NULL DEFAULT '',
        base_locator        TEXT NOT NULL,
        trust_level         SMALLINT NOT NULL DEFAULT 5,
        enabled             BOOLEAN NOT NULL DEFAULT TRUE,
        config              JSONB NOT NULL DEFAULT '{}'::jsonb,
        last_external_id    TEXT,
        last_poll_at        TIMESTAMPTZ,
        error_count         INTEGER NOT NULL DEFAULT 0,
        backfill_completed  BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS news (
        id                  UUID PRIMARY KEY,
        source_id           UUID NOT NULL REFERENCES sources(id),
        external_id         TEXT NOT NULL,
        title               TEXT NOT NULL,
        text_body           TEXT NOT NULL,
        summary             TEXT,
        published_at        TIMESTAMPTZ NOT NULL,
        detected_at         TIMESTAMPTZ NOT NULL,
        url                 TEXT,
        lang                TEXT NOT NULL DEFAULT 'ru',
        content_hash        CHAR(64) NOT NULL,
        is_ad               BOOLEAN NOT NULL DEFAULT FALSE,
        ad_score            DOUBLE PRECISION NOT NULL DEFAULT 0,
        ad_reasons          JSONB NOT NULL DEFAULT '[]'::jsonb,
        enrichment_status   TEXT NOT NULL DEFAULT 'pending',
        CONSTRAINT news_source_external_key UNIQUE (source_id, external_id),
        CONSTRAINT news_content_hash_key UNIQUE (content_hash)
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS news_enrichment_idx ON news (enrichment_status, detected_at)"#,
    r#"CREATE INDEX IF NOT EXISTS news_published_idx ON news (published_at DESC)"#,
    r#"
    CREATE INDEX IF NOT EXISTS news_fts_idx ON news
        USING GIN (to_tsvector('russian', title || ' ' || text_body))
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS images (
        id          UUID PRIMARY KEY,
        sha256      CHAR(64) NOT NULL UNIQUE,
        mime_type   TEXT NOT NULL,
        width       INTEGER,
        height      INTEGER,
        file_size   INTEGER NOT NULL,
        bytes       BYTEA NOT NULL,
        thumbnail   BYTEA
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS news_images (
        news_id     UUID NOT NULL REFERENCES news(id) ON DELETE CASCADE,
        image_id    UUID NOT NULL REFERENCES images(id) ON DELETE CASCADE,
        PRIMARY KEY (news_id, image_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entities (
        id          UUID PRIMARY KEY,
        news_id     UUID NOT NULL REFERENCES news(id) ON DELETE CASCADE,
        kind        TEXT NOT NULL,
        raw_text    TEXT NOT NULL,
        normalized  TEXT NOT NULL,
        confidence  DOUBLE PRECISION NOT NULL DEFAULT 0,
        attrs       JSONB NOT NULL DEFAULT '{}'::jsonb
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS entities_news_idx ON entities (news_id)"#,
    r#"
    CREATE TABLE IF NOT EXISTS issuers (
        id              UUID PRIMARY KEY,
        legal_name      TEXT NOT NULL,
        short_names     JSONB NOT NULL DEFAULT '[]'::jsonb,
        ticker          TEXT NOT NULL UNIQUE,
        isin            TEXT,
        board           TEXT,
        sector_id       TEXT,
        country_code    TEXT NOT NULL DEFAULT 'RU',
        is_traded       BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS aliases (
        normalized  TEXT PRIMARY KEY,
        ticker      TEXT NOT NULL,
        origin      TEXT NOT NULL,
        confidence  DOUBLE PRECISION NOT NULL DEFAULT 1.0,
        tombstoned  BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS linked_companies (
        news_id     UUID NOT NULL REFERENCES news(id) ON DELETE CASCADE,
        issuer_id   UUID NOT NULL REFERENCES issuers(id),
        ticker      TEXT NOT NULL,
        method      TEXT NOT NULL,
        score       DOUBLE PRECISION NOT NULL DEFAULT 0,
        is_primary  BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (news_id, issuer_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS topics (
        news_id     UUID NOT NULL REFERENCES news(id) ON DELETE CASCADE,
        code        TEXT NOT NULL,
        confidence  DOUBLE PRECISION NOT NULL DEFAULT 0,
        is_primary  BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (news_id, code)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id          UUID PRIMARY KEY,
        news_id     UUID NOT NULL REFERENCES news(id) ON DELETE CASCADE,
        event_type  TEXT NOT NULL,
        title       TEXT NOT NULL,
        ts          TIMESTAMPTZ NOT NULL,
        attrs       JSONB NOT NULL DEFAULT '{}'::jsonb,
        is_anchor   BOOLEAN NOT NULL DEFAULT FALSE,
        confidence  DOUBLE PRECISION NOT NULL DEFAULT 0,
        importance  DOUBLE PRECISION
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS events_ts_idx ON events (ts)"#,
    r#"CREATE INDEX IF NOT EXISTS events_type_idx ON events (event_type, ts)"#,
    r#"
    CREATE TABLE IF NOT EXISTS outbox (
        id              UUID PRIMARY KEY,
        topic           TEXT NOT NULL,
        payload         JSONB NOT NULL,
        status          TEXT NOT NULL DEFAULT 'pending',
        retries         INTEGER NOT NULL DEFAULT 0,
        next_attempt_at TIMESTAMPTZ NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL,
        sent_at         TIMESTAMPTZ
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS outbox_due_idx ON outbox (status, next_attempt_at, created_at)"#,
];

pub async fn init_schema(pool: &PgPool) -> PipelineResult<()> {
    for stmt in STATEMENTS {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}
