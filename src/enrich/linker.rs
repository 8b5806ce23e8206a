// src/enrich/linker.rs
//! Resolve free-text organisation mentions to exchange issuers.
//!
//! Resolution order: alias cache (curated, then learned), then a fuzzy query
//! against the securities master scored by name similarity plus instrument
//! bonuses. A confident fresh resolution is learned back into the cache.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::enrich::aliases::AliasCache;
use crate::error::PipelineResult;
use crate::market::{SecuritiesMaster, SecurityRecord};
use crate::model::{Alias, AliasOrigin, LinkMethod};

/// Legal-form and filler words dropped during normalization.
static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "компания", "группа", "холдинг", "корпорация", "банк", "пао", "оао", "ооо", "ао", "зао",
        "нко", "нпф", "company", "group", "holding", "corporation", "bank", "jsc", "pjsc", "llc",
        "ltd", "inc", "corp", "plc",
    ]
    .into_iter()
    .collect()
});

static RE_QUOTES: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[«»"'`„“”]"#).unwrap());
static RE_SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-/]").unwrap());
static RE_TRAILING_DOT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.(\s|$)").unwrap());
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Normalize an organisation mention for alias lookup and similarity.
pub fn normalize_org_name(name: &str) -> String {
    let mut s = name.to_lowercase();
    s = RE_QUOTES.replace_all(&s, "").to_string();
    s = RE_SEPARATORS.replace_all(&s, " ").to_string();
    s = RE_TRAILING_DOT.replace_all(&s, "$1").to_string();
    let words: Vec<&str> = s
        .split_whitespace()
        .filter(|w| !STOP_WORDS.contains(w))
        .collect();
    RE_WS.replace_all(words.join(" ").trim(), " ").to_string()
}

/// Name similarity in [0, 1]: Jaro-Winkler catches near-spellings,
/// normalized Levenshtein penalizes length drift.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    0.6 * strsim::jaro_winkler(a, b) + 0.4 * strsim::normalized_levenshtein(a, b)
}

/// Candidates below this similarity are ignored outright; the instrument
/// bonuses must never carry an unrelated name over the learn threshold.
pub const MIN_NAME_SIMILARITY: f64 = 0.55;

/// Similarity of a query against a record's short and full names.
pub fn record_similarity(normalized_query: &str, record: &SecurityRecord) -> f64 {
    let short_norm = normalize_org_name(&record.shortname);
    let full_norm = normalize_org_name(&record.name);
    name_similarity(normalized_query, &short_norm)
        .max(name_similarity(normalized_query, &full_norm))
}

/// Score one master record against a normalized query.
/// Name similarity contributes up to 50 points; instrument facts add
/// traded +20, equity market +15, primary board +10, ISIN +25.
pub fn score_candidate(normalized_query: &str, record: &SecurityRecord) -> f64 {
    let similarity = record_similarity(normalized_query, record);

    let mut score = similarity * 50.0;
    if record.is_traded {
        score += 20.0;
    }
    if record.market == "shares" {
        score += 15.0;
    }
    if matches!(record.primary_boardid.as_deref(), Some("TQBR") | Some("TQTF")) {
        score += 10.0;
    }
    if record.isin.is_some() {
        score += 25.0;
    }
    score
}

/// Outcome of a successful resolution. The caller upserts the issuer and
/// writes the LinkedCompany row.
#[derive(Debug, Clone)]
pub struct LinkResolution {
    pub ticker: String,
    pub method: LinkMethod,
    pub score: f64,
    /// Present when the resolution came from a master search.
    pub security: Option<SecurityRecord>,
}

pub struct Linker {
    aliases: Arc<AliasCache>,
    master: Arc<dyn SecuritiesMaster>,
    auto_learn_threshold: f64,
}

impl Linker {
    pub fn new(
        aliases: Arc<AliasCache>,
        master: Arc<dyn SecuritiesMaster>,
        auto_learn_threshold: f64,
    ) -> Self {
        Self {
            aliases,
            master,
            auto_learn_threshold,
        }
    }

    /// Resolve one organisation mention; `None` means no LinkedCompany is
    /// written. Master errors degrade to unresolved rather than failing the
    /// news item.
    pub async fn resolve(&self, org_text: &str) -> PipelineResult<Option<LinkResolution>> {
        let normalized = normalize_org_name(org_text);
        if normalized.is_empty() {
            return Ok(None);
        }

        // 1–2. Alias cache, curated before learned by construction.
        if let Some(alias) = self.aliases.lookup(&normalized) {
            let method = match alias.origin {
                AliasOrigin::Curated => LinkMethod::AliasExact,
                AliasOrigin::Learned => LinkMethod::AutoLearned,
            };
            metrics::counter!("linker_resolved_total").increment(1);
            return Ok(Some(LinkResolution {
                ticker: alias.ticker,
                method,
                score: alias.confidence * 100.0,
                security: None,
            }));
        }

        // 3. Fuzzy query against the securities master.
        let candidates = match self.master.search(org_text).await {
            Ok(c) => c,
            Err(e) => {
                debug!(target: "enrich", org = %org_text, error = %e, "master search failed");
                metrics::counter!("linker_unresolved_total").increment(1);
                return Ok(None);
            }
        };

        let best = candidates
            .iter()
            .filter(|rec| record_similarity(&normalized, rec) >= MIN_NAME_SIMILARITY)
            .map(|rec| (score_candidate(&normalized, rec), rec))
            .max_by(|(sa, ra), (sb, rb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // tie-breaker: shorter name wins, so reverse on length
                    .then(rb.shortname.len().cmp(&ra.shortname.len()))
            });

        let Some((score, record)) = best else {
            metrics::counter!("linker_unresolved_total").increment(1);
            return Ok(None);
        };

        // 4. Confident resolution → learn the alias for next time.
        if score >= self.auto_learn_threshold {
            self.aliases.learn(Alias {
                normalized: normalized.clone(),
                ticker: record.secid.clone(),
                origin: AliasOrigin::Learned,
                confidence: (score / 100.0).min(1.0),
            });
            metrics::counter!("linker_resolved_total").increment(1);
            metrics::counter!("linker_auto_learned_total").increment(1);
            return Ok(Some(LinkResolution {
                ticker: record.secid.clone(),
                method: LinkMethod::Fuzzy,
                score,
                security: Some(record.clone()),
            }));
        }

        // 5. Below threshold → unresolved.
        metrics::counter!("linker_unresolved_total").increment(1);
        Ok(None)
    }
}
