// src/graph.rs
//! Causal-event-graph store. Every mutation is an idempotent MERGE keyed by
//! a stable id: `created_at` is set on create, `updated_at` on match, and
//! relationship properties are fully replaced. The service talks to the
//! `CegGraph` trait; `Neo4jGraphWriter` is the real store, `MemoryGraph`
//! backs tests and graphless deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use neo4rs::query;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::model::{CausalEdge, EdgeKind, EdgeSign, Event, ImpactEdge, Issuer, News};

/// An edge plus facts about its endpoints the traversal needs.
#[derive(Debug, Clone)]
pub struct EdgeRecord {
    pub edge: CausalEdge,
    pub cause_type: String,
    pub cause_ts: DateTime<Utc>,
    pub effect_type: String,
    pub effect_ts: DateTime<Utc>,
}

#[async_trait]
pub trait CegGraph: Send + Sync {
    async fn ensure_constraints(&self) -> PipelineResult<()>;

    async fn merge_news(&self, news: &News) -> PipelineResult<()>;
    async fn merge_issuer(&self, issuer: &Issuer) -> PipelineResult<()>;
    async fn link_news_about(&self, news_id: Uuid, issuer_id: Uuid, score: f64) -> PipelineResult<()>;
    async fn merge_event(&self, event: &Event) -> PipelineResult<()>;
    async fn link_news_mentions(&self, news_id: Uuid, event_id: Uuid) -> PipelineResult<()>;

    async fn merge_causes(&self, edge: &CausalEdge) -> PipelineResult<()>;
    async fn delete_causes(&self, cause_id: Uuid, effect_id: Uuid) -> PipelineResult<()>;
    async fn incoming_causes(&self, effect_id: Uuid) -> PipelineResult<Vec<EdgeRecord>>;
    async fn outgoing_causes(&self, cause_id: Uuid) -> PipelineResult<Vec<EdgeRecord>>;

    async fn merge_instrument(&self, ticker: &str) -> PipelineResult<()>;
    async fn merge_impact(&self, edge: &ImpactEdge) -> PipelineResult<()>;
}

// ---------------------------------------------------------------------------
// Neo4j implementation
// ---------------------------------------------------------------------------

pub struct Neo4jGraphWriter {
    graph: neo4rs::Graph,
}

impl Neo4jGraphWriter {
    pub async fn connect(uri: &str, user: &str, password: &str) -> PipelineResult<Self> {
        let graph = neo4rs::Graph::new(uri, user, password)
            .await
            .map_err(|e| PipelineError::TransientIo(format!("connecting neo4j: {e}")))?;
        Ok(Self { graph })
    }

    async fn run(&self, q: neo4rs::Query) -> PipelineResult<()> {
        self.graph
            .run(q)
            .await
            .map_err(|e| PipelineError::Downstream(format!("graph: {e}")))
    }
}

fn edge_from_values(
    props: HashMap<String, serde_json::Value>,
    cause_id: Uuid,
    effect_id: Uuid,
) -> CausalEdge {
    let f = |k: &str| props.get(k).and_then(|v| v.as_f64()).unwrap_or(0.0);
    let s = |k: &str| props.get(k).and_then(|v| v.as_str()).unwrap_or("").to_string();
    let kind = match s("kind").as_str() {
        "confirmed" => EdgeKind::Confirmed,
        "retro" => EdgeKind::Retro,
        _ => EdgeKind::Hypothesis,
    };
    let sign = match s("sign").as_str() {
        "+" => EdgeSign::Plus,
        "-" => EdgeSign::Minus,
        _ => EdgeSign::Both,
    };
    let evidence_set = props
        .get("evidence_set")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()))
                .collect()
        })
        .unwrap_or_default();
    CausalEdge {
        cause_id,
        effect_id,
        kind,
        sign,
        expected_lag: s("expected_lag"),
        conf_prior: f("conf_prior"),
        conf_text: f("conf_text"),
        conf_market: f("conf_market"),
        conf_total: f("conf_total"),
        evidence_set,
        is_retroactive: props
            .get("is_retroactive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    }
}

#[async_trait]
impl CegGraph for Neo4jGraphWriter {
    async fn ensure_constraints(&self) -> PipelineResult<()> {
        for label in ["Event", "Issuer", "Instrument", "Market", "Sector", "Country", "News"] {
            let stmt = format!(
                "CREATE CONSTRAINT {}_id_unique IF NOT EXISTS FOR (n:{label}) REQUIRE n.id IS UNIQUE",
                label.to_lowercase()
            );
            self.run(query(&stmt)).await?;
        }
        Ok(())
    }

    async fn merge_news(&self, news: &News) -> PipelineResult<()> {
        let q = query(
            "MERGE (n:News {id: $id})
             ON CREATE SET n.created_at = datetime($now)
             ON MATCH SET n.updated_at = datetime($now)
             SET n.title = $title, n.url = $url, n.published_at = datetime($published_at),
                 n.lang = $lang",
        )
        .param("id", news.id.to_string())
        .param("now", Utc::now().to_rfc3339())
        .param("title", news.title.as_str())
        .param("url", news.url.clone().unwrap_or_default())
        .param("published_at", news.published_at.to_rfc3339())
        .param("lang", news.lang.as_str());
        self.run(q).await
    }

    async fn merge_issuer(&self, issuer: &Issuer) -> PipelineResult<()> {
        let q = query(
            "MERGE (i:Issuer {id: $id})
             ON CREATE SET i.created_at = datetime($now)
             ON MATCH SET i.updated_at = datetime($now)
             SET i.ticker = $ticker, i.name = $name, i.isin = $isin,
                 i.country_code = $country, i.is_traded = $is_traded",
        )
        .param("id", issuer.id.to_string())
        .param("now", Utc::now().to_rfc3339())
        .param("ticker", issuer.ticker.as_str())
        .param("name", issuer.legal_name.as_str())
        .param("isin", issuer.isin.clone().unwrap_or_default())
        .param("country", issuer.country_code.as_str())
        .param("is_traded", issuer.is_traded);
        self.run(q).await?;

        if let Some(sector) = &issuer.sector_id {
            let q = query(
                "MERGE (s:Sector {id: $sector})
                 ON CREATE SET s.created_at = datetime($now)
                 WITH s MATCH (i:Issuer {id: $id})
                 MERGE (i)-[:IN_SECTOR]->(s)",
            )
            .param("sector", sector.as_str())
            .param("now", Utc::now().to_rfc3339())
            .param("id", issuer.id.to_string());
            self.run(q).await?;
        }

        let q = query(
            "MERGE (m:Market {id: 'MOEX'})
             ON CREATE SET m.created_at = datetime($now)
             WITH m MATCH (i:Issuer {id: $id})
             MERGE (i)-[:TRADED_ON]->(m)",
        )
        .param("now", Utc::now().to_rfc3339())
        .param("id", issuer.id.to_string());
        self.run(q).await
    }

    async fn link_news_about(&self, news_id: Uuid, issuer_id: Uuid, score: f64) -> PipelineResult<()> {
        let q = query(
            "MATCH (n:News {id: $news_id}) MATCH (i:Issuer {id: $issuer_id})
             MERGE (n)-[r:ABOUT]->(i)
             SET r.score = $score, r.updated_at = datetime($now)",
        )
        .param("news_id", news_id.to_string())
        .param("issuer_id", issuer_id.to_string())
        .param("score", score)
        .param("now", Utc::now().to_rfc3339());
        self.run(q).await
    }

    async fn merge_event(&self, event: &Event) -> PipelineResult<()> {
        let q = query(
            "MERGE (e:Event {id: $id})
             ON CREATE SET e.created_at = datetime($now)
             ON MATCH SET e.updated_at = datetime($now)
             SET e.type = $type, e.title = $title, e.ts = datetime($ts),
                 e.is_anchor = $is_anchor, e.confidence = $confidence,
                 e.tickers = $tickers, e.news_id = $news_id",
        )
        .param("id", event.id.to_string())
        .param("now", Utc::now().to_rfc3339())
        .param("type", event.event_type.as_str())
        .param("title", event.title.as_str())
        .param("ts", event.ts.to_rfc3339())
        .param("is_anchor", event.is_anchor)
        .param("confidence", event.confidence)
        .param("tickers", event.attrs.tickers.clone())
        .param("news_id", event.news_id.to_string());
        self.run(q).await
    }

    async fn link_news_mentions(&self, news_id: Uuid, event_id: Uuid) -> PipelineResult<()> {
        let q = query(
            "MATCH (n:News {id: $news_id}) MATCH (e:Event {id: $event_id})
             MERGE (n)-[:MENTIONS]->(e)",
        )
        .param("news_id", news_id.to_string())
        .param("event_id", event_id.to_string());
        self.run(q).await
    }

    async fn merge_causes(&self, edge: &CausalEdge) -> PipelineResult<()> {
        let q = query(
            "MATCH (c:Event {id: $cause_id}) MATCH (e:Event {id: $effect_id})
             MERGE (c)-[r:CAUSES]->(e)
             SET r.kind = $kind, r.sign = $sign, r.expected_lag = $expected_lag,
                 r.conf_prior = $conf_prior, r.conf_text = $conf_text,
                 r.conf_market = $conf_market, r.conf_total = $conf_total,
                 r.evidence_set = $evidence_set, r.is_retroactive = $is_retroactive,
                 r.updated_at = datetime($now)",
        )
        .param("cause_id", edge.cause_id.to_string())
        .param("effect_id", edge.effect_id.to_string())
        .param("kind", edge.kind.as_str())
        .param("sign", edge.sign.as_str())
        .param("expected_lag", edge.expected_lag.as_str())
        .param("conf_prior", edge.conf_prior)
        .param("conf_text", edge.conf_text)
        .param("conf_market", edge.conf_market)
        .param("conf_total", edge.conf_total)
        .param(
            "evidence_set",
            edge.evidence_set.iter().map(|u| u.to_string()).collect::<Vec<_>>(),
        )
        .param("is_retroactive", edge.is_retroactive)
        .param("now", Utc::now().to_rfc3339());
        self.run(q).await
    }

    async fn delete_causes(&self, cause_id: Uuid, effect_id: Uuid) -> PipelineResult<()> {
        let q = query(
            "MATCH (:Event {id: $cause_id})-[r:CAUSES]->(:Event {id: $effect_id}) DELETE r",
        )
        .param("cause_id", cause_id.to_string())
        .param("effect_id", effect_id.to_string());
        self.run(q).await
    }

    async fn incoming_causes(&self, effect_id: Uuid) -> PipelineResult<Vec<EdgeRecord>> {
        self.fetch_edges(
            "MATCH (c:Event)-[r:CAUSES]->(e:Event {id: $id})
             RETURN c.id AS cause_id, e.id AS effect_id, c.type AS cause_type,
                    toString(c.ts) AS cause_ts, e.type AS effect_type, toString(e.ts) AS effect_ts,
                    r.kind AS kind, r.sign AS sign, r.expected_lag AS expected_lag,
                    r.conf_prior AS conf_prior, r.conf_text AS conf_text,
                    r.conf_market AS conf_market, r.conf_total AS conf_total,
                    r.evidence_set AS evidence_set, r.is_retroactive AS is_retroactive",
            effect_id,
        )
        .await
    }

    async fn outgoing_causes(&self, cause_id: Uuid) -> PipelineResult<Vec<EdgeRecord>> {
        self.fetch_edges(
            "MATCH (c:Event {id: $id})-[r:CAUSES]->(e:Event)
             RETURN c.id AS cause_id, e.id AS effect_id, c.type AS cause_type,
                    toString(c.ts) AS cause_ts, e.type AS effect_type, toString(e.ts) AS effect_ts,
                    r.kind AS kind, r.sign AS sign, r.expected_lag AS expected_lag,
                    r.conf_prior AS conf_prior, r.conf_text AS conf_text,
                    r.conf_market AS conf_market, r.conf_total AS conf_total,
                    r.evidence_set AS evidence_set, r.is_retroactive AS is_retroactive",
            cause_id,
        )
        .await
    }

    async fn merge_instrument(&self, ticker: &str) -> PipelineResult<()> {
        let q = query(
            "MERGE (i:Instrument {id: $id})
             ON CREATE SET i.created_at = datetime($now), i.symbol = $symbol,
                           i.exchange = 'MOEX', i.currency = 'RUB'
             ON MATCH SET i.updated_at = datetime($now)",
        )
        .param("id", format!("MOEX:{ticker}"))
        .param("now", Utc::now().to_rfc3339())
        .param("symbol", ticker);
        self.run(q).await
    }

    async fn merge_impact(&self, edge: &ImpactEdge) -> PipelineResult<()> {
        let q = query(
            "MATCH (e:Event {id: $event_id}) MATCH (i:Instrument {id: $instrument_id})
             MERGE (e)-[r:IMPACTS]->(i)
             SET r.ar = $ar, r.car = $car, r.volume_ratio = $volume_ratio,
                 r.window = $window, r.significant = $significant,
                 r.updated_at = datetime($now)",
        )
        .param("event_id", edge.event_id.to_string())
        .param("instrument_id", format!("MOEX:{}", edge.ticker))
        .param("ar", edge.ar)
        .param("car", edge.car)
        .param("volume_ratio", edge.volume_ratio)
        .param("window", edge.window.as_str())
        .param("significant", edge.significant)
        .param("now", Utc::now().to_rfc3339());
        self.run(q).await
    }
}

impl Neo4jGraphWriter {
    async fn fetch_edges(&self, cypher: &str, id: Uuid) -> PipelineResult<Vec<EdgeRecord>> {
        let q = query(cypher).param("id", id.to_string());
        let mut stream = self
            .graph
            .execute(q)
            .await
            .map_err(|e| PipelineError::Downstream(format!("graph: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = stream.next().await {
            let get_str =
                |k: &str| row.get::<String>(k).unwrap_or_default();
            let get_f = |k: &str| row.get::<f64>(k).unwrap_or(0.0);

            let cause_id = Uuid::parse_str(&get_str("cause_id")).unwrap_or_default();
            let effect_id = Uuid::parse_str(&get_str("effect_id")).unwrap_or_default();
            let mut props: HashMap<String, serde_json::Value> = HashMap::new();
            props.insert("kind".into(), serde_json::json!(get_str("kind")));
            props.insert("sign".into(), serde_json::json!(get_str("sign")));
            props.insert("expected_lag".into(), serde_json::json!(get_str("expected_lag")));
            props.insert("conf_prior".into(), serde_json::json!(get_f("conf_prior")));
            props.insert("conf_text".into(), serde_json::json!(get_f("conf_text")));
            props.insert("conf_market".into(), serde_json::json!(get_f("conf_market")));
            props.insert("conf_total".into(), serde_json::json!(get_f("conf_total")));
            props.insert(
                "evidence_set".into(),
                serde_json::json!(row.get::<Vec<String>>("evidence_set").unwrap_or_default()),
            );
            props.insert(
                "is_retroactive".into(),
                serde_json::json!(row.get::<bool>("is_retroactive").unwrap_or(false)),
            );

            let parse_ts = |s: String| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now())
            };

            out.push(EdgeRecord {
                edge: edge_from_values(props, cause_id, effect_id),
                cause_type: get_str("cause_type"),
                cause_ts: parse_ts(get_str("cause_ts")),
                effect_type: get_str("effect_type"),
                effect_ts: parse_ts(get_str("effect_ts")),
            });
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests, graphless deployments)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    events: HashMap<Uuid, (String, DateTime<Utc>)>,
    edges: HashMap<(Uuid, Uuid), CausalEdge>,
    impacts: HashMap<(Uuid, String), ImpactEdge>,
}

#[derive(Default)]
pub struct MemoryGraph {
    state: RwLock<MemoryState>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn edge(&self, cause: Uuid, effect: Uuid) -> Option<CausalEdge> {
        self.state.read().edges.get(&(cause, effect)).cloned()
    }

    pub fn edge_count(&self) -> usize {
        self.state.read().edges.len()
    }

    pub fn impact_count(&self) -> usize {
        self.state.read().impacts.len()
    }

    fn record(&self, state: &MemoryState, edge: &CausalEdge) -> Option<EdgeRecord> {
        let (cause_type, cause_ts) = state.events.get(&edge.cause_id)?.clone();
        let (effect_type, effect_ts) = state.events.get(&edge.effect_id)?.clone();
        Some(EdgeRecord {
            edge: edge.clone(),
            cause_type,
            cause_ts,
            effect_type,
            effect_ts,
        })
    }
}

#[async_trait]
impl CegGraph for MemoryGraph {
    async fn ensure_constraints(&self) -> PipelineResult<()> {
        Ok(())
    }

    async fn merge_news(&self, _news: &News) -> PipelineResult<()> {
        Ok(())
    }

    async fn merge_issuer(&self, _issuer: &Issuer) -> PipelineResult<()> {
        Ok(())
    }

    async fn link_news_about(&self, _news_id: Uuid, _issuer_id: Uuid, _score: f64) -> PipelineResult<()> {
        Ok(())
    }

    async fn merge_event(&self, event: &Event) -> PipelineResult<()> {
        self.state
            .write()
            .events
            .insert(event.id, (event.event_type.clone(), event.ts));
        Ok(())
    }

    async fn link_news_mentions(&self, _news_id: Uuid, _event_id: Uuid) -> PipelineResult<()> {
        Ok(())
    }

    async fn merge_causes(&self, edge: &CausalEdge) -> PipelineResult<()> {
        self.state
            .write()
            .edges
            .insert((edge.cause_id, edge.effect_id), edge.clone());
        Ok(())
    }

    async fn delete_causes(&self, cause_id: Uuid, effect_id: Uuid) -> PipelineResult<()> {
        self.state.write().edges.remove(&(cause_id, effect_id));
        Ok(())
    }

    async fn incoming_causes(&self, effect_id: Uuid) -> PipelineResult<Vec<EdgeRecord>> {
        let state = self.state.read();
        Ok(state
            .edges
            .values()
            .filter(|e| e.effect_id == effect_id)
            .filter_map(|e| self.record(&state, e))
            .collect())
    }

    async fn outgoing_causes(&self, cause_id: Uuid) -> PipelineResult<Vec<EdgeRecord>> {
        let state = self.state.read();
        Ok(state
            .edges
            .values()
            .filter(|e| e.cause_id == cause_id)
            .filter_map(|e| self.record(&state, e))
            .collect())
    }

    async fn merge_instrument(&self, _ticker: &str) -> PipelineResult<()> {
        Ok(())
    }

    async fn merge_impact(&self, edge: &ImpactEdge) -> PipelineResult<()> {
        self.state
            .write()
            .impacts
            .insert((edge.event_id, edge.ticker.clone()), edge.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventAttrs;

    fn event(event_type: &str) -> Event {
        Event {
            id: Uuid::new_v4(),
            news_id: Uuid::new_v4(),
            event_type: event_type.into(),
            title: event_type.into(),
            ts: Utc::now(),
            attrs: EventAttrs::default(),
            is_anchor: false,
            confidence: 0.8,
        }
    }

    fn edge(cause: &Event, effect: &Event, conf_total: f64) -> CausalEdge {
        CausalEdge {
            cause_id: cause.id,
            effect_id: effect.id,
            kind: EdgeKind::Hypothesis,
            sign: EdgeSign::Minus,
            expected_lag: "0-1d".into(),
            conf_prior: 0.5,
            conf_text: 0.0,
            conf_market: 0.4,
            conf_total,
            evidence_set: Vec::new(),
            is_retroactive: false,
        }
    }

    #[tokio::test]
    async fn memory_graph_merge_is_idempotent_and_replaces_props() {
        let g = MemoryGraph::new();
        let a = event("sanctions");
        let b = event("stock_drop");
        g.merge_event(&a).await.unwrap();
        g.merge_event(&b).await.unwrap();

        g.merge_causes(&edge(&a, &b, 0.4)).await.unwrap();
        g.merge_causes(&edge(&a, &b, 0.55)).await.unwrap();
        assert_eq!(g.edge_count(), 1);
        assert!((g.edge(a.id, b.id).unwrap().conf_total - 0.55).abs() < 1e-9);

        let incoming = g.incoming_causes(b.id).await.unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].cause_type, "sanctions");

        g.delete_causes(a.id, b.id).await.unwrap();
        assert_eq!(g.edge_count(), 0);
    }
}
