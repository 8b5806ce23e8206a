// src/ingest/mod.rs
pub mod backfill;
pub mod channel;
pub mod html;
pub mod scheduler;
pub mod types;

use metrics::counter;
use once_cell::sync::OnceCell;
use tracing::warn;

use crate::antispam::AntispamScorer;
use crate::error::PipelineResult;
use crate::model::{News, OutboxEvent, Source};
use crate::storage::{InsertOutcome, MediaFetcher, NewsWriter};
use types::FetchedItem;

/// Normalize article/message text: decode HTML entities, strip tags, fold
/// typographic quotes, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, " ").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}', '\u{201E}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // Cap pathological bodies; enough for any real article.
    if out.chars().count() > 16_384 {
        out = out.chars().take(16_384).collect();
    }
    out
}

/// Cheap language heuristic: share of Cyrillic letters among all letters.
pub fn detect_lang(text: &str) -> &'static str {
    let mut cyr = 0usize;
    let mut letters = 0usize;
    for ch in text.chars() {
        if ch.is_alphabetic() {
            letters += 1;
            if ('\u{0400}'..='\u{04FF}').contains(&ch) {
                cyr += 1;
            }
        }
    }
    if letters == 0 || cyr * 10 >= letters * 3 {
        "ru"
    } else {
        "en"
    }
}

/// Exponential backoff `base · 2^n`, capped. Jitter is the caller's business.
pub fn backoff_secs(error_count: u32, base_secs: u64, cap_secs: u64) -> u64 {
    let shift = error_count.min(30);
    base_secs.saturating_mul(1u64 << shift).min(cap_secs)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub kept: usize,
    pub duplicates: usize,
    pub ads_flagged: usize,
    pub malformed: usize,
}

/// Score, normalize and persist a batch of fetched items in order.
///
/// Each item is one atomic unit: news + images + its `news.created` outbox
/// row commit together or not at all. Ads are persisted flagged (they stay
/// readable) but no enrichment will touch them. Duplicate outcomes are
/// expected, not errors.
pub async fn process_batch(
    source: &Source,
    items: Vec<FetchedItem>,
    scorer: &AntispamScorer,
    media: &dyn MediaFetcher,
    writer: &dyn NewsWriter,
) -> PipelineResult<IngestOutcome> {
    let mut outcome = IngestOutcome::default();

    for item in items {
        let mut raw = item.raw;
        raw.title = normalize_text(&raw.title);
        raw.text = normalize_text(&raw.text);
        if raw.title.is_empty() && raw.text.is_empty() {
            outcome.malformed += 1;
            counter!("ingest_malformed_total").increment(1);
            continue;
        }

        let full_text = format!("{} {}", raw.title, raw.text);
        let verdict = scorer.score(&full_text, &item.shape, source.trust_level);
        if verdict.is_ad {
            outcome.ads_flagged += 1;
            counter!("ingest_ads_total").increment(1);
        }

        // Media fetch is best effort; a dead link never blocks the item.
        let mut images = Vec::new();
        for url in raw.media_refs.iter().take(4) {
            match media.fetch(url).await {
                Some(img) => images.push(img),
                None => warn!(target: "ingest", url = %url, "media fetch failed, skipping"),
            }
        }

        let lang = detect_lang(&full_text);
        let news = News::from_raw(raw, lang, verdict.is_ad, verdict.score, verdict.reasons);
        let outbox = OutboxEvent::pending(
            "news.created",
            serde_json::json!({
                "news_id": news.id,
                "source_id": news.source_id,
                "external_id": news.external_id,
                "published_at": news.published_at,
                "is_ad": news.is_ad,
            }),
        );

        match writer.insert_news(&news, &images, &outbox).await? {
            InsertOutcome::Inserted => {
                outcome.kept += 1;
                counter!("ingest_kept_total").increment(1);
            }
            InsertOutcome::DuplicateOnHash | InsertOutcome::DuplicateOnExternalId => {
                outcome.duplicates += 1;
                counter!("ingest_duplicates_total").increment(1);
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_tags_and_entities() {
        let s = "  <p>ЦБ&nbsp;повысил</p>  ставку&hellip; <a href=\"x\">тут</a> ";
        let out = normalize_text(s);
        assert_eq!(out, "ЦБ повысил ставку… тут");
    }

    #[test]
    fn normalize_folds_quotes() {
        assert_eq!(normalize_text("ПАО «Лукойл»"), "ПАО \"Лукойл\"");
    }

    #[test]
    fn lang_detection() {
        assert_eq!(detect_lang("ЦБ повысил ключевую ставку"), "ru");
        assert_eq!(detect_lang("Fed raises rates by 25 bps"), "en");
        // mixed text with a dominant Cyrillic share stays Russian
        assert_eq!(detect_lang("Акции SBER выросли"), "ru");
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_secs(0, 2, 900), 2);
        assert_eq!(backoff_secs(1, 2, 900), 4);
        assert_eq!(backoff_secs(5, 2, 900), 64);
        assert_eq!(backoff_secs(20, 2, 900), 900);
        assert_eq!(backoff_secs(u32::MAX, 2, 900), 900);
    }
}
