//! Shared test doubles: in-memory event history, synthetic candle source.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use news_causal_engine::error::PipelineResult;
use news_causal_engine::events::EventHistory;
use news_causal_engine::market::{Candle, CandleSource};
use news_causal_engine::model::{Event, OutboxEvent};

/// In-memory `EventHistory`: preloaded events with their news texts, plus a
/// record of everything the service reports back.
#[derive(Default)]
pub struct MemoryHistory {
    pub events: Mutex<Vec<(Event, String)>>,
    pub outbox: Mutex<Vec<OutboxEvent>>,
    pub importance: Mutex<HashMap<Uuid, f64>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preload(&self, event: Event, news_text: &str) {
        self.events.lock().push((event, news_text.to_string()));
    }

    pub fn outbox_topics(&self) -> Vec<String> {
        self.outbox.lock().iter().map(|o| o.topic.clone()).collect()
    }
}

#[async_trait]
impl EventHistory for MemoryHistory {
    async fn recent_events_with_text(
        &self,
        since: DateTime<Utc>,
        exclude_news: Uuid,
        limit: i64,
    ) -> PipelineResult<Vec<(Event, String)>> {
        let mut out: Vec<_> = self
            .events
            .lock()
            .iter()
            .filter(|(e, _)| e.ts >= since && e.news_id != exclude_news)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.0.ts.cmp(&a.0.ts));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn future_events_with_text(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        exclude_news: Uuid,
        limit: i64,
    ) -> PipelineResult<Vec<(Event, String)>> {
        let mut out: Vec<_> = self
            .events
            .lock()
            .iter()
            .filter(|(e, _)| e.ts > from && e.ts <= until && e.news_id != exclude_news)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.0.ts.cmp(&b.0.ts));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn events_between(
        &self,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
        limit: i64,
    ) -> PipelineResult<Vec<Event>> {
        let mut out: Vec<_> = self
            .events
            .lock()
            .iter()
            .filter(|(e, _)| e.ts > after && e.ts < before)
            .map(|(e, _)| e.clone())
            .collect();
        out.sort_by_key(|e| e.ts);
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn set_event_importance(&self, event_id: Uuid, score: f64) -> PipelineResult<()> {
        self.importance.lock().insert(event_id, score);
        Ok(())
    }

    async fn emit_outbox(&self, event: &OutboxEvent) -> PipelineResult<()> {
        self.outbox.lock().push(event.clone());
        Ok(())
    }
}

/// Candle source producing a flat daily series with one shock on a chosen
/// date, per ticker. Unknown tickers yield no data.
pub struct SyntheticCandles {
    pub shocks: HashMap<String, (DateTime<Utc>, f64, f64)>,
    pub series_start: DateTime<Utc>,
    pub series_days: i64,
}

impl SyntheticCandles {
    pub fn new() -> Self {
        Self {
            shocks: HashMap::new(),
            series_start: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            series_days: 120,
        }
    }

    pub fn with_shock(mut self, ticker: &str, on: DateTime<Utc>, ret: f64, volume: f64) -> Self {
        self.shocks.insert(ticker.to_string(), (on, ret, volume));
        self
    }
}

#[async_trait]
impl CandleSource for SyntheticCandles {
    async fn candles(
        &self,
        ticker: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        _interval: &str,
    ) -> PipelineResult<Vec<Candle>> {
        let Some((shock_on, shock_ret, shock_volume)) = self.shocks.get(ticker).copied() else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        let mut price = 100.0;
        for d in 0..self.series_days {
            let ts = self.series_start + Duration::days(d);
            let drift = if d % 2 == 0 { 0.001 } else { -0.001 };
            let (ret, volume) = if ts.date_naive() == shock_on.date_naive() {
                (shock_ret, shock_volume)
            } else {
                (drift, 1_000_000.0)
            };
            price *= 1.0 + ret;
            if ts >= from && ts <= to {
                out.push(Candle {
                    ts,
                    open: price,
                    high: price * 1.01,
                    low: price * 0.99,
                    close: price,
                    volume,
                });
            }
        }
        Ok(out)
    }
}
