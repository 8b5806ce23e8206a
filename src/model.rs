//! Core domain records shared across the pipeline.
//!
//! The relational store holds the nodes (news, entities, events, …); the
//! graph store holds the edges. Events reference news by id only; there are
//! no back-references, lookups go through explicit queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    MessageChannel,
    Html,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::MessageChannel => "message_channel",
            SourceKind::Html => "html",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message_channel" => Some(SourceKind::MessageChannel),
            "html" => Some(SourceKind::Html),
            _ => None,
        }
    }
}

/// Adapter cursor + health, owned exclusively by the polling task of the source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParserState {
    pub last_external_id: Option<String>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub backfill_completed: bool,
}

#[derive(Debug, Clone)]
pub struct Source {
    pub id: Uuid,
    pub code: String,
    pub kind: SourceKind,
    pub display_name: String,
    pub base_locator: String,
    /// 0..=10; gates the antispam threshold and anchor eligibility.
    pub trust_level: u8,
    pub enabled: bool,
    pub config: serde_json::Value,
    pub parser_state: ParserState,
}

// ---------------------------------------------------------------------------
// News
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::InProgress => "in_progress",
            EnrichmentStatus::Done => "done",
            EnrichmentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EnrichmentStatus::Pending),
            "in_progress" => Some(EnrichmentStatus::InProgress),
            "done" => Some(EnrichmentStatus::Done),
            "failed" => Some(EnrichmentStatus::Failed),
            _ => None,
        }
    }
}

/// Uniform record emitted by every adapter, before persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawNews {
    pub source_id: Uuid,
    pub external_id: String,
    pub title: String,
    pub text: String,
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub url: Option<String>,
    pub media_refs: Vec<String>,
    pub raw_meta: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct News {
    pub id: Uuid,
    pub source_id: Uuid,
    pub external_id: String,
    pub title: String,
    pub text: String,
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    pub url: Option<String>,
    pub lang: String,
    pub content_hash: String,
    pub is_ad: bool,
    pub ad_score: f64,
    pub ad_reasons: Vec<String>,
    pub enrichment_status: EnrichmentStatus,
}

impl News {
    /// Build a persistable news row from an adapter record plus an antispam verdict.
    pub fn from_raw(raw: RawNews, lang: &str, is_ad: bool, ad_score: f64, ad_reasons: Vec<String>) -> Self {
        let content_hash = content_hash(&raw.title, &raw.text);
        News {
            id: Uuid::new_v4(),
            source_id: raw.source_id,
            external_id: raw.external_id,
            title: raw.title,
            text: raw.text,
            summary: raw.summary,
            published_at: raw.published_at,
            detected_at: Utc::now(),
            url: raw.url,
            lang: lang.to_string(),
            content_hash,
            is_ad,
            ad_score,
            ad_reasons,
            enrichment_status: EnrichmentStatus::Pending,
        }
    }
}

/// 256-bit dedup key over the normalized title + body.
pub fn content_hash(title: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().as_bytes());
    hasher.update(b"\n");
    hasher.update(text.trim().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Org,
    Person,
    Location,
    Date,
    Money,
    Percentage,
    Amount,
    Period,
    Unit,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Org => "org",
            EntityKind::Person => "person",
            EntityKind::Location => "location",
            EntityKind::Date => "date",
            EntityKind::Money => "money",
            EntityKind::Percentage => "percentage",
            EntityKind::Amount => "amount",
            EntityKind::Period => "period",
            EntityKind::Unit => "unit",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub news_id: Uuid,
    pub kind: EntityKind,
    pub raw_text: String,
    pub normalized: String,
    pub confidence: f64,
    pub attrs: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Reference data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issuer {
    pub id: Uuid,
    pub legal_name: String,
    pub short_names: Vec<String>,
    pub ticker: String,
    pub isin: Option<String>,
    pub board: Option<String>,
    pub sector_id: Option<String>,
    pub country_code: String,
    pub is_traded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasOrigin {
    Curated,
    Learned,
}

impl AliasOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            AliasOrigin::Curated => "curated",
            AliasOrigin::Learned => "learned",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alias {
    pub normalized: String,
    pub ticker: String,
    pub origin: AliasOrigin,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMethod {
    AliasExact,
    Fuzzy,
    AutoLearned,
}

impl LinkMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkMethod::AliasExact => "alias_exact",
            LinkMethod::Fuzzy => "fuzzy",
            LinkMethod::AutoLearned => "auto_learned",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkedCompany {
    pub news_id: Uuid,
    pub issuer_id: Uuid,
    pub ticker: String,
    pub method: LinkMethod,
    pub score: f64,
    pub is_primary: bool,
}

#[derive(Debug, Clone)]
pub struct Topic {
    pub news_id: Uuid,
    pub code: String,
    pub confidence: f64,
    pub is_primary: bool,
}

// ---------------------------------------------------------------------------
// Events & causal edges
// ---------------------------------------------------------------------------

/// Typed attributes attached to an extracted event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventAttrs {
    #[serde(default)]
    pub companies: Vec<String>,
    #[serde(default)]
    pub tickers: Vec<String>,
    #[serde(default)]
    pub people: Vec<serde_json::Value>,
    #[serde(default)]
    pub markets: Vec<serde_json::Value>,
    #[serde(default)]
    pub metrics: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: Uuid,
    pub news_id: Uuid,
    pub event_type: String,
    pub title: String,
    pub ts: DateTime<Utc>,
    pub attrs: EventAttrs,
    pub is_anchor: bool,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Hypothesis,
    Retro,
    Confirmed,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Hypothesis => "hypothesis",
            EdgeKind::Retro => "retro",
            EdgeKind::Confirmed => "confirmed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeSign {
    #[serde(rename = "+")]
    Plus,
    #[serde(rename = "-")]
    Minus,
    #[serde(rename = "±")]
    Both,
}

impl EdgeSign {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeSign::Plus => "+",
            EdgeSign::Minus => "-",
            EdgeSign::Both => "±",
        }
    }
}

/// Payload of a CAUSES edge between two events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalEdge {
    pub cause_id: Uuid,
    pub effect_id: Uuid,
    pub kind: EdgeKind,
    pub sign: EdgeSign,
    pub expected_lag: String,
    pub conf_prior: f64,
    pub conf_text: f64,
    pub conf_market: f64,
    pub conf_total: f64,
    pub evidence_set: Vec<Uuid>,
    pub is_retroactive: bool,
}

/// Payload of an IMPACTS edge from an event to an instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactEdge {
    pub event_id: Uuid,
    pub ticker: String,
    pub ar: f64,
    pub car: f64,
    pub volume_ratio: f64,
    pub window: String,
    pub significant: bool,
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
    DeadLettered,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
            OutboxStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "sent" => Some(OutboxStatus::Sent),
            "failed" => Some(OutboxStatus::Failed),
            "dead_lettered" => Some(OutboxStatus::DeadLettered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retries: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn pending(topic: &str, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        OutboxEvent {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            payload,
            status: OutboxStatus::Pending,
            retries: 0,
            next_attempt_at: now,
            created_at: now,
        }
    }
}

/// JSON envelope published to the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_and_trims() {
        let a = content_hash("Title", "Body text");
        let b = content_hash("  Title  ", "Body text\n");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_hash("Title", "Other body"));
    }

    #[test]
    fn event_round_trips_through_json() {
        let ev = Event {
            id: Uuid::new_v4(),
            news_id: Uuid::new_v4(),
            event_type: "rate_hike".into(),
            title: "ЦБ повысил ключевую ставку".into(),
            ts: Utc::now(),
            attrs: EventAttrs {
                companies: vec!["Сбербанк".into()],
                tickers: vec!["SBER".into()],
                ..Default::default()
            },
            is_anchor: true,
            confidence: 0.8,
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(ev, back);
    }

    #[test]
    fn edge_sign_serializes_symbolically() {
        assert_eq!(serde_json::to_string(&EdgeSign::Plus).unwrap(), "\"+\"");
        assert_eq!(serde_json::to_string(&EdgeSign::Both).unwrap(), "\"±\"");
    }

    #[test]
    fn envelope_round_trip_is_byte_identical() {
        let env = Envelope {
            kind: "news.created".into(),
            occurred_at: "2025-03-01T10:00:00Z".parse().unwrap(),
            payload: serde_json::json!({"news_id": "abc", "source": "interfax"}),
        };
        let bytes = serde_json::to_vec(&env).unwrap();
        let back: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(env, back);
        assert_eq!(bytes, serde_json::to_vec(&back).unwrap());
    }
}
