// src/storage/outbox.rs
//! Outbox table access for the relay. Claiming uses skip-locked rows so
//! several relay partitions can drain the same queue without contention.

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::model::{OutboxEvent, OutboxStatus};

#[derive(Clone)]
pub struct OutboxStore {
    pool: PgPool,
}

impl OutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin(&self) -> PipelineResult<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Rows due for publishing, locked for this transaction; other relay
    /// loops skip them.
    pub async fn claim_due(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        now: DateTime<Utc>,
        batch: u32,
    ) -> PipelineResult<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, payload, status, retries, next_attempt_at, created_at
            FROM outbox
            WHERE status IN ('pending', 'failed') AND next_attempt_at <= $1
            ORDER BY created_at
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(batch as i64)
        .fetch_all(&mut **tx)
        .await?;
        rows.iter().map(outbox_from_row).collect()
    }

    pub async fn mark_sent(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> PipelineResult<()> {
        sqlx::query("UPDATE outbox SET status = 'sent', sent_at = $2 WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Schedule the next attempt, or dead-letter once the budget is spent.
    pub async fn mark_failed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        retries_so_far: u32,
        max_retries: u32,
        base_retry_seconds: i64,
        now: DateTime<Utc>,
    ) -> PipelineResult<OutboxStatus> {
        let retries = retries_so_far + 1;
        if retries >= max_retries {
            sqlx::query("UPDATE outbox SET status = 'dead_lettered', retries = $2 WHERE id = $1")
                .bind(id)
                .bind(retries as i32)
                .execute(&mut **tx)
                .await?;
            return Ok(OutboxStatus::DeadLettered);
        }
        let delay = base_retry_seconds.saturating_mul(1i64 << (retries - 1).min(30));
        let next = now + Duration::seconds(delay);
        sqlx::query(
            "UPDATE outbox SET status = 'failed', retries = $2, next_attempt_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(retries as i32)
        .bind(next)
        .execute(&mut **tx)
        .await?;
        Ok(OutboxStatus::Failed)
    }

    /// Drop sent rows older than the retention horizon.
    pub async fn purge_sent(&self, keep_days: i64, now: DateTime<Utc>) -> PipelineResult<u64> {
        let cutoff = now - Duration::days(keep_days);
        let res = sqlx::query("DELETE FROM outbox WHERE status = 'sent' AND sent_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    pub async fn pending_count(&self) -> PipelineResult<u64> {
        let n: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE status IN ('pending', 'failed')")
                .fetch_one(&self.pool)
                .await?;
        Ok(n.max(0) as u64)
    }

    pub async fn status_counts(&self) -> PipelineResult<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM outbox GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn outbox_from_row(row: &PgRow) -> PipelineResult<OutboxEvent> {
    let status_str: String = row.try_get("status").map_err(decode)?;
    let status = OutboxStatus::parse(&status_str)
        .ok_or_else(|| PipelineError::DataValidation(format!("bad outbox status `{status_str}`")))?;
    Ok(OutboxEvent {
        id: row.try_get("id").map_err(decode)?,
        topic: row.try_get("topic").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        status,
        retries: row.try_get::<i32, _>("retries").map_err(decode)? as u32,
        next_attempt_at: row.try_get("next_attempt_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

fn decode(e: sqlx::Error) -> PipelineError {
    PipelineError::DataValidation(format!("row decode: {e}"))
}
