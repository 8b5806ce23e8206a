// src/events/cmnln.rs
//! CMNLN scoring: domain priors + causal text markers + market reaction,
//! blended into one confidence per ordered event pair. Pure code: all storage
//! and graph I/O stays in the service layer, so every rule here is testable
//! on plain values.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::{CegConfig, CegWeights};
use crate::model::{CausalEdge, EdgeKind, EdgeSign, Event};

/// One domain rule: events of `cause_type` tend to produce `effect_type`
/// with the given sign inside the expected lag.
#[derive(Debug, Clone)]
pub struct DomainPrior {
    pub cause_type: &'static str,
    pub effect_type: &'static str,
    pub sign: EdgeSign,
    pub expected_lag: &'static str,
    pub conf_prior: f64,
}

const fn prior(
    cause_type: &'static str,
    effect_type: &'static str,
    sign: EdgeSign,
    expected_lag: &'static str,
    conf_prior: f64,
) -> DomainPrior {
    DomainPrior {
        cause_type,
        effect_type,
        sign,
        expected_lag,
        conf_prior,
    }
}

/// Curated causal rules for the Russian market domain.
pub static DOMAIN_PRIORS: &[DomainPrior] = &[
    prior("sanctions", "market_drop", EdgeSign::Minus, "0-1d", 0.75),
    prior("sanctions", "stock_drop", EdgeSign::Minus, "0-3d", 0.65),
    prior("sanctions", "rub_depreciation", EdgeSign::Minus, "0-1d", 0.60),
    prior("rate_hike", "rub_appreciation", EdgeSign::Plus, "1h-1d", 0.65),
    prior("rate_hike", "bank_stock_up", EdgeSign::Plus, "0-3d", 0.60),
    prior("rate_cut", "rub_depreciation", EdgeSign::Minus, "1h-1d", 0.60),
    prior("earnings_beat", "stock_rally", EdgeSign::Plus, "0-1d", 0.70),
    prior("earnings_miss", "stock_drop", EdgeSign::Minus, "0-1d", 0.75),
    prior("guidance_cut", "stock_drop", EdgeSign::Minus, "0-1d", 0.70),
    prior("mna", "target_stock_up", EdgeSign::Plus, "0-1d", 0.80),
    prior("mna", "stock_rally", EdgeSign::Plus, "0-1d", 0.65),
    prior("default", "bond_crash", EdgeSign::Minus, "0-1h", 0.90),
    prior("default", "stock_drop", EdgeSign::Minus, "0-1d", 0.75),
    prior("dividend_cut", "stock_drop", EdgeSign::Minus, "0-1d", 0.65),
    prior("dividends", "stock_rally", EdgeSign::Plus, "0-1d", 0.55),
    prior("buyback", "stock_rally", EdgeSign::Plus, "0-3d", 0.60),
    prior("regulatory", "sector_drop", EdgeSign::Minus, "1-7d", 0.55),
    prior("regulatory", "stock_drop", EdgeSign::Minus, "1-7d", 0.50),
    prior("supply_chain", "production", EdgeSign::Minus, "1-4w", 0.50),
    prior("accident", "stock_drop", EdgeSign::Minus, "0-1d", 0.65),
    prior("strike", "production", EdgeSign::Minus, "0-3d", 0.50),
    prior("management_change", "stock_volatility", EdgeSign::Both, "0-3d", 0.45),
];

/// Closed set of causal connectors with per-marker weights; the strongest
/// match in either news text becomes `conf_text`.
pub static CAUSAL_MARKERS: &[(&str, f64)] = &[
    ("привело к", 0.9),
    ("вызвало", 0.9),
    ("стало причиной", 0.9),
    ("из-за", 0.8),
    ("в результате", 0.8),
    ("вследствие", 0.8),
    ("повлекло", 0.8),
    ("спровоцировало", 0.8),
    ("в связи с", 0.7),
    ("следствие", 0.7),
    ("на фоне", 0.6),
    ("после", 0.5),
    ("caused by", 0.9),
    ("led to", 0.9),
    ("due to", 0.8),
    ("because of", 0.8),
    ("as a result of", 0.8),
    ("resulted in", 0.8),
];

static LAG_RANGES: Lazy<HashMap<&'static str, (i64, i64)>> = Lazy::new(|| {
    HashMap::from([
        ("0-1h", (0, 3_600)),
        ("1h-1d", (3_600, 86_400)),
        ("0-1d", (0, 86_400)),
        ("0-3d", (0, 259_200)),
        ("1-7d", (86_400, 604_800)),
        ("1-4w", (604_800, 2_419_200)),
        ("0-7d", (0, 604_800)),
    ])
});

/// Penalty applied to `conf_total` when the observed lag falls outside the
/// prior's expected interval.
pub const LAG_MISMATCH_FACTOR: f64 = 0.75;

/// Strongest causal connector found in either text.
pub fn conf_text(cause_text: &str, effect_text: &str) -> f64 {
    let a = cause_text.to_lowercase();
    let b = effect_text.to_lowercase();
    CAUSAL_MARKERS
        .iter()
        .filter(|(marker, _)| a.contains(marker) || b.contains(marker))
        .map(|(_, w)| *w)
        .fold(0.0, f64::max)
}

pub fn lag_range(expected: &str) -> Option<(i64, i64)> {
    LAG_RANGES.get(expected).copied()
}

/// Scoring context for one ordered pair.
#[derive(Debug, Clone, Default)]
pub struct PairContext {
    pub cause_text: String,
    pub effect_text: String,
    pub conf_market: f64,
    /// Retroactive pass (late-reported cause).
    pub retroactive: bool,
}

pub struct CmnlnEngine {
    priors: HashMap<(&'static str, &'static str), &'static DomainPrior>,
    weights: CegWeights,
    min_confidence: f64,
    retro_types: Vec<String>,
}

impl CmnlnEngine {
    pub fn new(cfg: &CegConfig) -> Self {
        let mut priors = HashMap::new();
        for p in DOMAIN_PRIORS {
            priors.insert((p.cause_type, p.effect_type), p);
        }
        Self {
            priors,
            weights: cfg.weights.clone(),
            min_confidence: cfg.min_confidence,
            retro_types: cfg.retro_types.clone(),
        }
    }

    pub fn prior_for(&self, cause_type: &str, effect_type: &str) -> Option<&DomainPrior> {
        self.priors.get(&(leak_free(cause_type)?, leak_free(effect_type)?)).copied()
    }

    pub fn is_retro_eligible(&self, event_type: &str) -> bool {
        self.retro_types.iter().any(|t| t == event_type)
    }

    pub fn total(&self, conf_prior: f64, conf_text: f64, conf_market: f64) -> f64 {
        self.weights.prior * conf_prior
            + self.weights.text * conf_text
            + self.weights.market * conf_market
    }

    /// Score one ordered pair. Temporal ordering is the caller's contract
    /// (forward passes feed `cause.ts ≤ effect.ts`; the retroactive pass may
    /// feed a late-reported cause). Returns `None` below the link threshold.
    pub fn score_pair(&self, cause: &Event, effect: &Event, ctx: &PairContext) -> Option<CausalEdge> {
        let prior = self.prior_for(&cause.event_type, &effect.event_type);
        let (conf_prior, sign, expected_lag) = match prior {
            Some(p) => (p.conf_prior, p.sign, p.expected_lag),
            None => (0.0, EdgeSign::Both, "0-7d"),
        };

        let text_score = conf_text(&ctx.cause_text, &ctx.effect_text);
        let mut conf_total = self.total(conf_prior, text_score, ctx.conf_market);

        let lag_secs = (effect.ts - cause.ts).num_seconds().abs();
        if let Some((min_lag, max_lag)) = lag_range(expected_lag) {
            if lag_secs < min_lag || lag_secs > max_lag {
                conf_total *= LAG_MISMATCH_FACTOR;
            }
        }

        if conf_total < self.min_confidence {
            return None;
        }

        let kind = if conf_prior >= 0.6 && text_score >= 0.6 && ctx.conf_market >= 0.6 {
            EdgeKind::Confirmed
        } else if ctx.retroactive {
            EdgeKind::Retro
        } else {
            EdgeKind::Hypothesis
        };

        Some(CausalEdge {
            cause_id: cause.id,
            effect_id: effect.id,
            kind,
            sign,
            expected_lag: expected_lag.to_string(),
            conf_prior,
            conf_text: text_score,
            conf_market: ctx.conf_market,
            conf_total,
            evidence_set: Vec::new(),
            is_retroactive: ctx.retroactive,
        })
    }

    /// Evidence events: strictly between cause and effect in time, sharing a
    /// company or ticker with either endpoint. Capped at three.
    pub fn find_evidence(&self, cause: &Event, effect: &Event, between: &[Event]) -> Vec<Uuid> {
        let (lo, hi) = if cause.ts <= effect.ts {
            (cause.ts, effect.ts)
        } else {
            (effect.ts, cause.ts)
        };
        between
            .iter()
            .filter(|ev| ev.id != cause.id && ev.id != effect.id)
            .filter(|ev| ev.ts > lo && ev.ts < hi)
            .filter(|ev| shares_entities(ev, cause) || shares_entities(ev, effect))
            .take(3)
            .map(|ev| ev.id)
            .collect()
    }

    /// Among candidate edges into the same effect, keep only the strongest
    /// cause per cause-type; ties keep the earlier cause.
    pub fn dominant_edges(
        &self,
        mut candidates: Vec<(CausalEdge, String)>,
    ) -> Vec<CausalEdge> {
        candidates.sort_by(|(ea, _), (eb, _)| {
            eb.conf_total
                .partial_cmp(&ea.conf_total)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut seen_types: Vec<String> = Vec::new();
        let mut out = Vec::new();
        for (edge, cause_type) in candidates {
            if seen_types.iter().any(|t| *t == cause_type) {
                continue;
            }
            seen_types.push(cause_type);
            out.push(edge);
        }
        out
    }
}

fn shares_entities(a: &Event, b: &Event) -> bool {
    let companies_overlap = a
        .attrs
        .companies
        .iter()
        .any(|c| b.attrs.companies.iter().any(|o| o.eq_ignore_ascii_case(c)));
    let tickers_overlap = a
        .attrs
        .tickers
        .iter()
        .any(|t| b.attrs.tickers.iter().any(|o| o == t));
    companies_overlap || tickers_overlap
}

/// Map a runtime string onto the static key space of the priors table.
fn leak_free(s: &str) -> Option<&'static str> {
    DOMAIN_PRIORS
        .iter()
        .flat_map(|p| [p.cause_type, p.effect_type])
        .find(|k| *k == s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn cfg() -> CegConfig {
        CegConfig::default()
    }

    fn event(event_type: &str, hour_offset: i64, tickers: &[&str]) -> Event {
        Event {
            id: Uuid::new_v4(),
            news_id: Uuid::new_v4(),
            event_type: event_type.into(),
            title: event_type.into(),
            ts: Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap() + Duration::hours(hour_offset),
            attrs: crate::model::EventAttrs {
                tickers: tickers.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            is_anchor: false,
            confidence: 0.8,
        }
    }

    #[test]
    fn rate_hike_to_rub_appreciation_matches_prior() {
        let engine = CmnlnEngine::new(&cfg());
        let cause = event("rate_hike", 0, &[]);
        let effect = event("rub_appreciation", 1, &[]);
        let edge = engine
            .score_pair(
                &cause,
                &effect,
                &PairContext {
                    conf_market: 0.4,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!((edge.conf_prior - 0.65).abs() < 1e-9);
        assert_eq!(edge.sign, EdgeSign::Plus);
        assert_eq!(edge.expected_lag, "1h-1d");
        assert_eq!(edge.kind, EdgeKind::Hypothesis);
        assert_eq!(edge.conf_text, 0.0);
        // 0.4·0.65 + 0.3·0 + 0.3·0.4
        assert!((edge.conf_total - 0.38).abs() < 1e-9);
    }

    #[test]
    fn weighted_total_is_exact() {
        let engine = CmnlnEngine::new(&cfg());
        let t = engine.total(0.75, 0.8, 0.5);
        assert!((t - (0.4 * 0.75 + 0.3 * 0.8 + 0.3 * 0.5)).abs() < 1e-12);
    }

    #[test]
    fn below_threshold_yields_no_edge() {
        let engine = CmnlnEngine::new(&cfg());
        // no prior between these types, no markers, no market reaction
        let cause = event("dividends", 0, &[]);
        let effect = event("rub_appreciation", 2, &[]);
        assert!(engine
            .score_pair(&cause, &effect, &PairContext::default())
            .is_none());
    }

    #[test]
    fn lag_mismatch_attenuates_total() {
        let engine = CmnlnEngine::new(&cfg());
        let cause = event("rate_hike", 0, &[]);
        // 30 minutes is below the 1h-1d expected lag
        let effect = Event {
            ts: cause.ts + Duration::minutes(30),
            ..event("rub_appreciation", 0, &[])
        };
        let ctx = PairContext {
            conf_market: 0.5,
            ..Default::default()
        };
        let edge = engine.score_pair(&cause, &effect, &ctx).unwrap();
        let unpenalized = engine.total(0.65, 0.0, 0.5);
        assert!((edge.conf_total - unpenalized * LAG_MISMATCH_FACTOR).abs() < 1e-9);
    }

    #[test]
    fn text_markers_take_strongest_match() {
        assert_eq!(conf_text("рынок упал из-за санкций", ""), 0.8);
        assert_eq!(conf_text("", "это привело к падению"), 0.9);
        assert_eq!(conf_text("после решения на фоне паники", ""), 0.6);
        assert_eq!(conf_text("ничего причинного", "тоже нет"), 0.0);
    }

    #[test]
    fn confirmed_requires_all_three_components() {
        let engine = CmnlnEngine::new(&cfg());
        let cause = event("earnings_miss", 0, &[]);
        let effect = event("stock_drop", 3, &["SBER"]);
        let ctx = PairContext {
            cause_text: "убыток привело к распродаже".into(),
            effect_text: String::new(),
            conf_market: 0.7,
            retroactive: false,
        };
        let edge = engine.score_pair(&cause, &effect, &ctx).unwrap();
        assert_eq!(edge.kind, EdgeKind::Confirmed);

        let weak_market = PairContext {
            conf_market: 0.5,
            ..ctx
        };
        let edge = engine.score_pair(&cause, &effect, &weak_market).unwrap();
        assert_eq!(edge.kind, EdgeKind::Hypothesis);
    }

    #[test]
    fn retro_pair_is_marked_retro() {
        let engine = CmnlnEngine::new(&cfg());
        // sanctions reported two days after the drop they explain
        let drop = event("stock_drop", 0, &["SBER"]);
        let sanctions = event("sanctions", 48, &[]);
        let ctx = PairContext {
            conf_market: 0.6,
            retroactive: true,
            ..Default::default()
        };
        let edge = engine.score_pair(&sanctions, &drop, &ctx).unwrap();
        assert!(edge.is_retroactive);
        assert_eq!(edge.kind, EdgeKind::Retro);
        assert_eq!(edge.sign, EdgeSign::Minus);
        // |Δt| = 48h inside 0-3d → no lag penalty
        assert!((edge.conf_total - engine.total(0.65, 0.0, 0.6)).abs() < 1e-9);
    }

    #[test]
    fn retro_eligibility_follows_config() {
        let engine = CmnlnEngine::new(&cfg());
        assert!(engine.is_retro_eligible("sanctions"));
        assert!(engine.is_retro_eligible("default"));
        assert!(!engine.is_retro_eligible("dividends"));
    }

    #[test]
    fn evidence_shares_entities_and_caps_at_three() {
        let engine = CmnlnEngine::new(&cfg());
        let cause = event("sanctions", 0, &["SBER"]);
        let effect = event("stock_drop", 72, &["SBER"]);
        let mut between = vec![
            event("legal", 10, &["SBER"]),
            event("earnings", 20, &["SBER"]),
            event("production", 30, &["GAZP"]), // no shared entity
            event("strike", 40, &["SBER"]),
            event("dividends", 50, &["SBER"]),
        ];
        // one outside the interval
        between.push(event("mna", 100, &["SBER"]));

        let evidence = engine.find_evidence(&cause, &effect, &between);
        assert_eq!(evidence.len(), 3);
        assert!(!evidence.contains(&between[2].id));
        assert!(!evidence.contains(&between[5].id));
    }

    #[test]
    fn dominance_keeps_strongest_per_cause_type() {
        let engine = CmnlnEngine::new(&cfg());
        let effect = event("stock_drop", 72, &["SBER"]);
        let weak_cause = event("sanctions", 0, &[]);
        let strong_cause = event("sanctions", 24, &[]);
        let other_cause = event("earnings_miss", 48, &["SBER"]);

        let weak = engine
            .score_pair(&weak_cause, &effect, &PairContext { conf_market: 0.31, ..Default::default() })
            .unwrap();
        let strong = engine
            .score_pair(&strong_cause, &effect, &PairContext { conf_market: 0.9, ..Default::default() })
            .unwrap();
        let other = engine
            .score_pair(&other_cause, &effect, &PairContext { conf_market: 0.9, ..Default::default() })
            .unwrap();

        let kept = engine.dominant_edges(vec![
            (weak.clone(), "sanctions".into()),
            (strong.clone(), "sanctions".into()),
            (other.clone(), "earnings_miss".into()),
        ]);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().any(|e| e.cause_id == strong.cause_id));
        assert!(kept.iter().all(|e| e.cause_id != weak.cause_id));
    }
}
