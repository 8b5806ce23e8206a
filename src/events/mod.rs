// src/events/mod.rs
//! Event layer: typed extraction, CMNLN causal scoring, event studies and
//! the service that stitches them onto the graph in real time.

pub mod cmnln;
pub mod extractor;
pub mod importance;
pub mod study;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CegConfig;
use crate::error::PipelineResult;
use crate::graph::{CegGraph, EdgeRecord};
use crate::model::{CausalEdge, Event, ImpactEdge, News, OutboxEvent};
use cmnln::{CmnlnEngine, PairContext};
use importance::{importance_score, ImportanceInputs};
use study::EventStudyAnalyser;

/// Storage the causal service reads event history from and reports back to.
/// `NewsRepository` implements it; tests provide an in-memory double.
#[async_trait]
pub trait EventHistory: Send + Sync {
    async fn recent_events_with_text(
        &self,
        since: DateTime<Utc>,
        exclude_news: Uuid,
        limit: i64,
    ) -> PipelineResult<Vec<(Event, String)>>;

    async fn future_events_with_text(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        exclude_news: Uuid,
        limit: i64,
    ) -> PipelineResult<Vec<(Event, String)>>;

    async fn events_between(
        &self,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
        limit: i64,
    ) -> PipelineResult<Vec<Event>>;

    async fn set_event_importance(&self, event_id: Uuid, score: f64) -> PipelineResult<()>;

    async fn emit_outbox(&self, event: &OutboxEvent) -> PipelineResult<()>;
}

#[async_trait]
impl EventHistory for crate::storage::news::NewsRepository {
    async fn recent_events_with_text(
        &self,
        since: DateTime<Utc>,
        exclude_news: Uuid,
        limit: i64,
    ) -> PipelineResult<Vec<(Event, String)>> {
        crate::storage::news::NewsRepository::recent_events_with_text(self, since, exclude_news, limit).await
    }

    async fn future_events_with_text(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        exclude_news: Uuid,
        limit: i64,
    ) -> PipelineResult<Vec<(Event, String)>> {
        crate::storage::news::NewsRepository::future_events_with_text(self, from, until, exclude_news, limit)
            .await
    }

    async fn events_between(
        &self,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
        limit: i64,
    ) -> PipelineResult<Vec<Event>> {
        crate::storage::news::NewsRepository::events_between(self, after, before, limit).await
    }

    async fn set_event_importance(&self, event_id: Uuid, score: f64) -> PipelineResult<()> {
        crate::storage::news::NewsRepository::set_event_importance(self, event_id, score).await
    }

    async fn emit_outbox(&self, event: &OutboxEvent) -> PipelineResult<()> {
        self.insert_outbox(event).await
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CegOutcome {
    pub forward_links: usize,
    pub internal_links: usize,
    pub retro_links: usize,
    pub impacts: usize,
    pub edges_dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainDirection {
    Forward,
    Backward,
}

/// Real-time CEG maintenance for a batch of events from one news item.
pub struct CegService {
    engine: CmnlnEngine,
    history: Arc<dyn EventHistory>,
    study: EventStudyAnalyser,
    graph: Arc<dyn CegGraph>,
    cfg: CegConfig,
    /// Per-event keyed mutex: two news racing on the same event id serialize
    /// their re-scoring instead of interleaving graph writes.
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl CegService {
    pub fn new(
        cfg: CegConfig,
        history: Arc<dyn EventHistory>,
        study: EventStudyAnalyser,
        graph: Arc<dyn CegGraph>,
    ) -> Self {
        Self {
            engine: CmnlnEngine::new(&cfg),
            history,
            study,
            graph,
            cfg,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &CmnlnEngine {
        &self.engine
    }

    async fn lock_for(&self, event_id: Uuid) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().await;
        map.entry(event_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Process the events of one freshly enriched news item: forward links,
    /// intra-news links, the retroactive pass, market impacts, importance.
    pub async fn process_news_events(
        &self,
        news: &News,
        events: &[Event],
        news_text: &str,
        source_trust: u8,
    ) -> PipelineResult<CegOutcome> {
        let mut outcome = CegOutcome::default();
        if events.is_empty() {
            return Ok(outcome);
        }

        for event in events {
            self.graph.merge_event(event).await?;
            self.graph.link_news_mentions(news.id, event.id).await?;
            counter!("ceg_events_total").increment(1);
        }

        let newest_ts = events.iter().map(|e| e.ts).max().unwrap_or(news.published_at);
        let since = newest_ts - Duration::days(self.cfg.lookback_days);
        let past = self
            .history
            .recent_events_with_text(since, news.id, 200)
            .await?;

        for event in events {
            let guard_handle = self.lock_for(event.id).await;
            let _guard = guard_handle.lock().await;

            let conf_market = self
                .study
                .market_confidence(&event.attrs.tickers, event.ts)
                .await;

            outcome.forward_links += self
                .forward_link(event, news_text, conf_market, &past)
                .await?;

            if self.engine.is_retro_eligible(&event.event_type) {
                outcome.retro_links += self.retro_link(news, event, news_text).await?;
            }

            outcome.impacts += self.impact_link(event).await?;
            self.score_importance(event, conf_market, source_trust, &past).await;
        }

        outcome.internal_links += self.internal_link(events, news_text).await?;

        info!(
            target: "ceg",
            news_id = %news.id,
            events = events.len(),
            forward = outcome.forward_links,
            internal = outcome.internal_links,
            retro = outcome.retro_links,
            impacts = outcome.impacts,
            "ceg updated"
        );
        Ok(outcome)
    }

    /// Past events explaining the new one: `e_past → e_new`.
    async fn forward_link(
        &self,
        e_new: &Event,
        news_text: &str,
        conf_market: f64,
        past: &[(Event, String)],
    ) -> PipelineResult<usize> {
        let mut candidates: Vec<(CausalEdge, String)> = Vec::new();
        for (e_past, past_text) in past {
            if e_past.ts > e_new.ts {
                continue;
            }
            let ctx = PairContext {
                cause_text: past_text.clone(),
                effect_text: news_text.to_string(),
                conf_market,
                retroactive: false,
            };
            if let Some(mut edge) = self.engine.score_pair(e_past, e_new, &ctx) {
                let between = self
                    .history
                    .events_between(e_past.ts, e_new.ts, 100)
                    .await?;
                edge.evidence_set = self.engine.find_evidence(e_past, e_new, &between);
                candidates.push((edge, e_past.event_type.clone()));
            }
        }

        // Same-type competition: only the strongest cause of each type survives.
        let kept = self.engine.dominant_edges(candidates);
        let mut created = 0usize;
        for edge in kept {
            self.upsert_edge(&edge).await?;
            created += 1;
        }
        Ok(created)
    }

    /// Pairs inside one news item, ordered by (ts, extraction order).
    async fn internal_link(&self, events: &[Event], news_text: &str) -> PipelineResult<usize> {
        let mut created = 0usize;
        for i in 0..events.len() {
            for j in (i + 1)..events.len() {
                let (cause, effect) = if events[j].ts < events[i].ts {
                    (&events[j], &events[i])
                } else {
                    (&events[i], &events[j])
                };
                let conf_market = self
                    .study
                    .market_confidence(&effect.attrs.tickers, effect.ts)
                    .await;
                let ctx = PairContext {
                    cause_text: news_text.to_string(),
                    effect_text: news_text.to_string(),
                    conf_market,
                    retroactive: false,
                };
                if let Some(edge) = self.engine.score_pair(cause, effect, &ctx) {
                    self.upsert_edge(&edge).await?;
                    created += 1;
                }
            }
        }
        Ok(created)
    }

    /// Retroactive pass for a late-arriving cause. Covers both windows:
    /// already-ingested events with later timestamps (out-of-order arrival)
    /// and earlier effects the new cause explains.
    async fn retro_link(&self, news: &News, e_new: &Event, news_text: &str) -> PipelineResult<usize> {
        let mut created = 0usize;
        let window = Duration::days(self.cfg.retro_window_days);

        let future = self
            .history
            .future_events_with_text(e_new.ts, e_new.ts + window, news.id, 100)
            .await?;
        let earlier = self
            .history
            .recent_events_with_text(e_new.ts - window, news.id, 100)
            .await?
            .into_iter()
            .filter(|(e, _)| e.ts < e_new.ts)
            // the explains direction needs a domain prior to exist
            .filter(|(e, _)| self.engine.prior_for(&e_new.event_type, &e.event_type).is_some())
            .collect::<Vec<_>>();

        for (e_other, other_text) in future.iter().chain(earlier.iter()) {
            let conf_market = self
                .study
                .market_confidence(&e_other.attrs.tickers, e_other.ts)
                .await;
            let ctx = PairContext {
                cause_text: news_text.to_string(),
                effect_text: other_text.clone(),
                conf_market,
                retroactive: true,
            };
            let Some(mut edge) = self.engine.score_pair(e_new, e_other, &ctx) else {
                continue;
            };

            // Same-pair competition against edges already on the effect.
            let existing = self.graph.incoming_causes(e_other.id).await?;
            let dominated = existing.iter().any(|rec| {
                rec.cause_type == e_new.event_type
                    && rec.edge.cause_id != e_new.id
                    && rec.edge.conf_total >= edge.conf_total
            });
            if dominated {
                continue;
            }
            for rec in existing.iter().filter(|rec| {
                rec.cause_type == e_new.event_type
                    && rec.edge.cause_id != e_new.id
                    && rec.edge.conf_total < edge.conf_total
            }) {
                self.graph
                    .delete_causes(rec.edge.cause_id, rec.edge.effect_id)
                    .await?;
                counter!("ceg_edges_dropped_total").increment(1);
            }

            let between = self
                .history
                .events_between(e_new.ts.min(e_other.ts), e_new.ts.max(e_other.ts), 100)
                .await?;
            edge.evidence_set = self.engine.find_evidence(e_new, e_other, &between);

            self.upsert_edge(&edge).await?;
            counter!("ceg_retro_links_total").increment(1);
            created += 1;
        }
        Ok(created)
    }

    /// Market reaction of an event on its instruments (first three tickers).
    async fn impact_link(&self, event: &Event) -> PipelineResult<usize> {
        let mut created = 0usize;
        for ticker in event.attrs.tickers.iter().take(3) {
            let Some(result) = self.study.analyze(ticker, event.ts).await else {
                continue;
            };
            if !result.significant {
                continue;
            }
            self.graph.merge_instrument(ticker).await?;
            let edge = ImpactEdge {
                event_id: event.id,
                ticker: ticker.clone(),
                ar: result.ar,
                car: result.car,
                volume_ratio: result.volume_ratio,
                window: "1d".into(),
                significant: true,
            };
            self.graph.merge_impact(&edge).await?;
            counter!("ceg_impacts_total").increment(1);
            created += 1;

            let outbox = OutboxEvent::pending(
                "event.impacts",
                serde_json::json!({
                    "event_id": event.id,
                    "ticker": ticker,
                    "ar": result.ar,
                    "car": result.car,
                    "volume_ratio": result.volume_ratio,
                }),
            );
            if let Err(e) = self.history.emit_outbox(&outbox).await {
                warn!(target: "ceg", error = %e, "impact outbox emit failed");
            }
        }
        Ok(created)
    }

    async fn upsert_edge(&self, edge: &CausalEdge) -> PipelineResult<()> {
        // Re-scored below the floor ⇒ the edge must not survive.
        if edge.conf_total < self.cfg.min_confidence {
            self.graph.delete_causes(edge.cause_id, edge.effect_id).await?;
            counter!("ceg_edges_dropped_total").increment(1);
            return Ok(());
        }
        self.graph.merge_causes(edge).await?;
        counter!("ceg_edges_upserted_total").increment(1);

        let outbox = OutboxEvent::pending(
            "event.caused",
            serde_json::json!({
                "cause_id": edge.cause_id,
                "effect_id": edge.effect_id,
                "kind": edge.kind.as_str(),
                "sign": edge.sign.as_str(),
                "conf_total": edge.conf_total,
                "is_retroactive": edge.is_retroactive,
            }),
        );
        if let Err(e) = self.history.emit_outbox(&outbox).await {
            warn!(target: "ceg", error = %e, "edge outbox emit failed");
        }
        Ok(())
    }

    async fn score_importance(
        &self,
        event: &Event,
        conf_market: f64,
        source_trust: u8,
        past: &[(Event, String)],
    ) {
        let similar_recent = past
            .iter()
            .filter(|(e, _)| e.event_type == event.event_type)
            .count();
        let day_ago = event.ts - Duration::hours(24);
        let same_type_last_24h = past
            .iter()
            .filter(|(e, _)| e.event_type == event.event_type && e.ts >= day_ago)
            .count();
        let inputs = ImportanceInputs {
            similar_recent,
            same_type_last_24h,
            source_trust,
            distinct_companies: event.attrs.companies.len(),
            distinct_markets: event.attrs.markets.len(),
            price_impact: Some(conf_market),
        };
        let score = importance_score(&inputs);
        gauge!("ceg_last_importance").set(score);
        if let Err(e) = self.history.set_event_importance(event.id, score).await {
            debug!(target: "ceg", error = %e, "importance save failed");
        }
    }

    /// Causal-chain BFS from a root event up to `max_depth`, honoring an
    /// optional confidence floor and temporal monotonicity per direction.
    pub async fn causal_chains(
        &self,
        root: Uuid,
        direction: ChainDirection,
        max_depth: usize,
        min_confidence: Option<f64>,
    ) -> PipelineResult<Vec<Vec<EdgeRecord>>> {
        let depth_cap = if max_depth == 0 {
            self.cfg.max_chain_depth
        } else {
            max_depth
        };
        let mut chains = Vec::new();
        let mut frontier: Vec<(Uuid, Vec<EdgeRecord>)> = vec![(root, Vec::new())];
        let mut visited = vec![root];

        for _ in 0..depth_cap {
            let mut next_frontier = Vec::new();
            for (node, path) in frontier {
                let hops = match direction {
                    ChainDirection::Forward => self.graph.outgoing_causes(node).await?,
                    ChainDirection::Backward => self.graph.incoming_causes(node).await?,
                };
                for rec in hops {
                    if let Some(floor) = min_confidence {
                        if rec.edge.conf_total < floor {
                            continue;
                        }
                    }
                    // monotonic time along the traversal direction
                    if let Some(last) = path.last() {
                        let ok = match direction {
                            ChainDirection::Forward => rec.effect_ts >= last.effect_ts,
                            ChainDirection::Backward => rec.cause_ts <= last.cause_ts,
                        };
                        if !ok {
                            continue;
                        }
                    }
                    let next_node = match direction {
                        ChainDirection::Forward => rec.edge.effect_id,
                        ChainDirection::Backward => rec.edge.cause_id,
                    };
                    if visited.contains(&next_node) {
                        continue;
                    }
                    visited.push(next_node);

                    let mut next_path = path.clone();
                    next_path.push(rec);
                    chains.push(next_path.clone());
                    next_frontier.push((next_node, next_path));
                }
            }
            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }
        Ok(chains)
    }
}
