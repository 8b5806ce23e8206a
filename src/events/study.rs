// src/events/study.rs
//! Event-study analyser: abnormal return, cumulative AR and volume spike for
//! a ticker around an event timestamp. The arithmetic is a pure function of
//! the candle series; the async wrapper only fetches data and degrades
//! missing history to zero confidence, never to a pipeline failure.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::config::EventStudyConfig;
use crate::market::{Candle, CandleSource};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventStudyResult {
    /// Abnormal return on the event day.
    pub ar: f64,
    /// Cumulative abnormal return over the event window.
    pub car: f64,
    /// Event-day volume over mean estimation volume.
    pub volume_ratio: f64,
    pub estimation_mean: f64,
    pub estimation_std: f64,
    pub significant: bool,
}

impl EventStudyResult {
    /// Market-reaction confidence for the causal engine:
    /// `min(1, |AR| / (2σ))` when significant, else 0.
    pub fn market_confidence(&self, sigma_mult: f64) -> f64 {
        if !self.significant || self.estimation_std <= 0.0 {
            return 0.0;
        }
        (self.ar.abs() / (sigma_mult * self.estimation_std)).min(1.0)
    }
}

/// Pure event-study computation over an ascending daily candle series.
/// Returns `None` when there are fewer than `min_observations` usable
/// estimation returns.
pub fn study_from_candles(
    candles: &[Candle],
    event_ts: DateTime<Utc>,
    cfg: &EventStudyConfig,
) -> Option<EventStudyResult> {
    if candles.len() < 2 {
        return None;
    }

    // Daily log of simple returns + volumes, aligned to the second candle.
    let mut returns = Vec::with_capacity(candles.len() - 1);
    let mut volumes = Vec::with_capacity(candles.len() - 1);
    let mut stamps = Vec::with_capacity(candles.len() - 1);
    for pair in candles.windows(2) {
        let (prev, curr) = (&pair[0], &pair[1]);
        if prev.close > 0.0 {
            returns.push((curr.close - prev.close) / prev.close);
            volumes.push(curr.volume);
            stamps.push(curr.ts);
        }
    }

    let event_date = event_ts.date_naive();
    let event_idx = stamps.iter().position(|ts| ts.date_naive() >= event_date)?;

    let estimation_start = event_idx.saturating_sub(cfg.estimation_days as usize);
    let estimation = &returns[estimation_start..event_idx];
    if estimation.len() < cfg.min_observations {
        return None;
    }

    let mean = estimation.iter().sum::<f64>() / estimation.len() as f64;
    let variance = estimation
        .iter()
        .map(|r| (r - mean).powi(2))
        .sum::<f64>()
        / (estimation.len() - 1) as f64;
    let std = variance.sqrt();

    let (win_before, win_after) = cfg.event_window;
    let win_start = event_idx.saturating_sub(win_before.unsigned_abs() as usize);
    let win_end = (event_idx + win_after.max(0) as usize).min(returns.len() - 1);
    let abnormal: Vec<f64> = returns[win_start..=win_end].iter().map(|r| r - mean).collect();

    let ar = returns[event_idx] - mean;
    let car: f64 = abnormal.iter().sum();
    let ar_peak = abnormal.iter().fold(0.0f64, |acc, a| acc.max(a.abs()));

    let estimation_volumes = &volumes[estimation_start..event_idx];
    let avg_volume = estimation_volumes.iter().sum::<f64>() / estimation_volumes.len() as f64;
    let volume_ratio = if avg_volume > 0.0 {
        volumes[event_idx] / avg_volume
    } else {
        1.0
    };

    let significant = ar_peak > cfg.significance_sigma * std || volume_ratio > 2.0;

    Some(EventStudyResult {
        ar,
        car,
        volume_ratio,
        estimation_mean: mean,
        estimation_std: std,
        significant,
    })
}

pub struct EventStudyAnalyser {
    source: Arc<dyn CandleSource>,
    cfg: EventStudyConfig,
}

impl EventStudyAnalyser {
    pub fn new(source: Arc<dyn CandleSource>, cfg: EventStudyConfig) -> Self {
        Self { source, cfg }
    }

    pub fn config(&self) -> &EventStudyConfig {
        &self.cfg
    }

    /// Study one ticker around `event_ts`. `Ok(None)` covers every degraded
    /// case: unknown ticker, missing candles, short history.
    pub async fn analyze(
        &self,
        ticker: &str,
        event_ts: DateTime<Utc>,
    ) -> Option<EventStudyResult> {
        let from = event_ts - Duration::days(self.cfg.estimation_days + 10);
        let to = event_ts + Duration::days(self.cfg.event_window.1.max(0) + 3);
        match self.source.candles(ticker, from, to, "1d").await {
            Ok(candles) => study_from_candles(&candles, event_ts, &self.cfg),
            Err(e) => {
                debug!(target: "ceg", ticker, error = %e, "candle fetch failed; zero confidence");
                None
            }
        }
    }

    /// `conf_market` for a set of candidate tickers: the first that yields a
    /// study decides; no ticker ⇒ 0.
    pub async fn market_confidence(&self, tickers: &[String], event_ts: DateTime<Utc>) -> f64 {
        for ticker in tickers {
            if let Some(result) = self.analyze(ticker, event_ts).await {
                return result.market_confidence(self.cfg.significance_sigma);
            }
        }
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cfg() -> EventStudyConfig {
        EventStudyConfig::default()
    }

    /// Flat series with one shock on the event day.
    fn candles_with_shock(days: i64, shock_pct: f64, shock_volume: f64) -> (Vec<Candle>, DateTime<Utc>) {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut out = Vec::new();
        let mut price = 100.0;
        for d in 0..days {
            let ts = start + Duration::days(d);
            // tiny alternating drift so the estimation variance is non-zero
            let drift = if d % 2 == 0 { 0.001 } else { -0.001 };
            let (ret, volume) = if d == days - 2 {
                (shock_pct, shock_volume)
            } else {
                (drift, 1_000_000.0)
            };
            price *= 1.0 + ret;
            out.push(Candle {
                ts,
                open: price,
                high: price * 1.01,
                low: price * 0.99,
                close: price,
                volume,
            });
        }
        let event_ts = start + Duration::days(days - 2);
        (out, event_ts)
    }

    #[test]
    fn shock_is_significant_with_high_confidence() {
        let (candles, event_ts) = candles_with_shock(40, -0.05, 4_000_000.0);
        let result = study_from_candles(&candles, event_ts, &cfg()).unwrap();
        assert!(result.significant);
        assert!(result.ar < -0.03, "ar = {}", result.ar);
        assert!(result.volume_ratio > 2.0);
        let conf = result.market_confidence(2.0);
        assert!(conf > 0.3, "conf_market = {conf}");
        assert!(conf <= 1.0);
    }

    #[test]
    fn quiet_day_is_not_significant() {
        let (candles, event_ts) = candles_with_shock(40, 0.001, 1_000_000.0);
        let result = study_from_candles(&candles, event_ts, &cfg()).unwrap();
        assert!(!result.significant);
        assert_eq!(result.market_confidence(2.0), 0.0);
    }

    #[test]
    fn short_history_yields_none() {
        let (candles, event_ts) = candles_with_shock(15, -0.05, 4_000_000.0);
        assert!(study_from_candles(&candles, event_ts, &cfg()).is_none());
    }

    #[test]
    fn empty_series_yields_none() {
        assert!(study_from_candles(&[], Utc::now(), &cfg()).is_none());
    }

    #[test]
    fn car_accumulates_over_window() {
        let (candles, event_ts) = candles_with_shock(40, -0.05, 4_000_000.0);
        let result = study_from_candles(&candles, event_ts, &cfg()).unwrap();
        // window is (-1, 1): event-day AR dominates the sum
        assert!(result.car < -0.03);
    }

    #[tokio::test]
    async fn analyser_degrades_errors_to_zero_confidence() {
        use async_trait::async_trait;
        use crate::error::{PipelineError, PipelineResult};

        struct FailingSource;
        #[async_trait]
        impl CandleSource for FailingSource {
            async fn candles(
                &self,
                _t: &str,
                _f: DateTime<Utc>,
                _to: DateTime<Utc>,
                _i: &str,
            ) -> PipelineResult<Vec<Candle>> {
                Err(PipelineError::NotFound("no such ticker".into()))
            }
        }

        let analyser = EventStudyAnalyser::new(Arc::new(FailingSource), cfg());
        let conf = analyser
            .market_confidence(&["NOPE".to_string()], Utc::now())
            .await;
        assert_eq!(conf, 0.0);
    }
}
