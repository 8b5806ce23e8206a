// src/market/prices.rs
//! OHLCV candle client. The exchange API is an external collaborator; the
//! analyser only sees the `CandleSource` trait, so tests run on synthetic
//! series. Daily responses are cached per (ticker, range); candle history
//! never changes retroactively.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::PipelineResult;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Candles in ascending time order. Missing data is an empty vector, not
    /// an error: the analyser degrades to zero confidence.
    async fn candles(
        &self,
        ticker: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: &str,
    ) -> PipelineResult<Vec<Candle>>;
}

pub struct HttpCandleSource {
    client: reqwest::Client,
    base_url: String,
    cache: RwLock<HashMap<String, Vec<Candle>>>,
}

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    #[serde(default)]
    candles: Vec<CandleRow>,
}

#[derive(Debug, Deserialize)]
struct CandleRow {
    ts: DateTime<Utc>,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
}

impl HttpCandleSource {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn cache_key(ticker: &str, from: &DateTime<Utc>, to: &DateTime<Utc>, interval: &str) -> String {
        format!(
            "{ticker}:{}:{}:{interval}",
            from.date_naive(),
            to.date_naive()
        )
    }
}

#[async_trait]
impl CandleSource for HttpCandleSource {
    async fn candles(
        &self,
        ticker: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: &str,
    ) -> PipelineResult<Vec<Candle>> {
        let key = Self::cache_key(ticker, &from, &to, interval);
        if let Some(hit) = self.cache.read().get(&key) {
            return Ok(hit.clone());
        }

        let resp = self
            .client
            .get(format!("{}/candles/{}", self.base_url, ticker))
            .query(&[
                ("from", from.date_naive().to_string()),
                ("to", to.date_naive().to_string()),
                ("interval", interval.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;
        let body: CandlesResponse = resp.json().await.map_err(crate::error::PipelineError::from)?;

        let mut candles: Vec<Candle> = body
            .candles
            .into_iter()
            .map(|r| Candle {
                ts: r.ts,
                open: r.o,
                high: r.h,
                low: r.l,
                close: r.c,
                volume: r.v,
            })
            .collect();
        candles.sort_by_key(|c| c.ts);

        self.cache.write().insert(key, candles.clone());
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_rows_deserialize() {
        let json = r#"{"candles": [
            {"ts": "2025-02-28T00:00:00Z", "o": 100.0, "h": 104.0, "l": 99.0, "c": 103.0, "v": 1500000},
            {"ts": "2025-03-01T00:00:00Z", "o": 103.0, "h": 103.5, "l": 98.0, "c": 98.5, "v": 4200000}
        ]}"#;
        let parsed: CandlesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.candles.len(), 2);
        assert!((parsed.candles[1].c - 98.5).abs() < 1e-9);
    }

    #[test]
    fn empty_response_is_not_an_error() {
        let parsed: CandlesResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.candles.is_empty());
    }
}
