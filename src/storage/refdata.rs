// src/storage/refdata.rs
//! Securities master mirror: issuers resolved from the external search API
//! plus the alias table (curated + learned). Learned aliases are additive:
//! an existing mapping is never overwritten by a lower-confidence one.

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::model::{Alias, AliasOrigin, Issuer};

#[derive(Clone)]
pub struct RefDataStore {
    pool: PgPool,
}

impl RefDataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or refresh an issuer keyed by ticker; returns the stored row.
    pub async fn upsert_issuer(&self, issuer: &Issuer) -> PipelineResult<Issuer> {
        let row = sqlx::query(
            r#"
            INSERT INTO issuers (id, legal_name, short_names, ticker, isin, board,
                                 sector_id, country_code, is_traded)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (ticker) DO UPDATE SET
                legal_name = EXCLUDED.legal_name,
                short_names = EXCLUDED.short_names,
                isin = COALESCE(EXCLUDED.isin, issuers.isin),
                board = COALESCE(EXCLUDED.board, issuers.board),
                sector_id = COALESCE(EXCLUDED.sector_id, issuers.sector_id),
                country_code = EXCLUDED.country_code,
                is_traded = EXCLUDED.is_traded
            RETURNING id, legal_name, short_names, ticker, isin, board, sector_id,
                      country_code, is_traded
            "#,
        )
        .bind(issuer.id)
        .bind(&issuer.legal_name)
        .bind(serde_json::to_value(&issuer.short_names).unwrap_or_default())
        .bind(&issuer.ticker)
        .bind(&issuer.isin)
        .bind(&issuer.board)
        .bind(&issuer.sector_id)
        .bind(&issuer.country_code)
        .bind(issuer.is_traded)
        .fetch_one(&self.pool)
        .await?;
        issuer_from_row(&row)
    }

    pub async fn issuer_by_ticker(&self, ticker: &str) -> PipelineResult<Option<Issuer>> {
        let row = sqlx::query(
            r#"
            SELECT id, legal_name, short_names, ticker, isin, board, sector_id,
                   country_code, is_traded
            FROM issuers WHERE ticker = $1
            "#,
        )
        .bind(ticker)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(issuer_from_row).transpose()
    }

    /// All live (non-tombstoned) aliases for the in-memory cache snapshot.
    pub async fn load_aliases(&self) -> PipelineResult<Vec<Alias>> {
        let rows = sqlx::query(
            "SELECT normalized, ticker, origin, confidence FROM aliases WHERE NOT tombstoned",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(alias_from_row).collect()
    }

    /// Persist a learned alias; a no-op when the key already exists.
    pub async fn insert_alias(&self, alias: &Alias) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO aliases (normalized, ticker, origin, confidence)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (normalized) DO NOTHING
            "#,
        )
        .bind(&alias.normalized)
        .bind(&alias.ticker)
        .bind(alias.origin.as_str())
        .bind(alias.confidence)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Operator escape hatch: retire a curated entry without losing history.
    pub async fn tombstone_alias(&self, normalized: &str) -> PipelineResult<()> {
        sqlx::query("UPDATE aliases SET tombstoned = TRUE WHERE normalized = $1")
            .bind(normalized)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn issuer_from_row(row: &PgRow) -> PipelineResult<Issuer> {
    let short_names: serde_json::Value = row.try_get("short_names").map_err(decode)?;
    Ok(Issuer {
        id: row.try_get("id").map_err(decode)?,
        legal_name: row.try_get("legal_name").map_err(decode)?,
        short_names: serde_json::from_value(short_names).unwrap_or_default(),
        ticker: row.try_get("ticker").map_err(decode)?,
        isin: row.try_get("isin").map_err(decode)?,
        board: row.try_get("board").map_err(decode)?,
        sector_id: row.try_get("sector_id").map_err(decode)?,
        country_code: row.try_get("country_code").map_err(decode)?,
        is_traded: row.try_get("is_traded").map_err(decode)?,
    })
}

fn alias_from_row(row: &PgRow) -> PipelineResult<Alias> {
    let origin_str: String = row.try_get("origin").map_err(decode)?;
    let origin = match origin_str.as_str() {
        "curated" => AliasOrigin::Curated,
        "learned" => AliasOrigin::Learned,
        other => {
            return Err(PipelineError::DataValidation(format!(
                "bad alias origin `{other}`"
            )))
        }
    };
    Ok(Alias {
        normalized: row.try_get("normalized").map_err(decode)?,
        ticker: row.try_get("ticker").map_err(decode)?,
        origin,
        confidence: row.try_get("confidence").map_err(decode)?,
    })
}

fn decode(e: sqlx::Error) -> PipelineError {
    PipelineError::DataValidation(format!("row decode: {e}"))
}

/// Issuer skeleton for a ticker discovered via the master search, before the
/// first full upsert.
pub fn issuer_from_security(
    ticker: &str,
    name: &str,
    shortname: &str,
    isin: Option<String>,
    board: Option<String>,
    is_traded: bool,
) -> Issuer {
    Issuer {
        id: Uuid::new_v4(),
        legal_name: name.to_string(),
        short_names: vec![shortname.to_string()],
        ticker: ticker.to_string(),
        isin,
        board,
        sector_id: None,
        country_code: "RU".into(),
        is_traded,
    }
}
