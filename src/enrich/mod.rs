// src/enrich/mod.rs
//! Enrichment pipeline: claim unenriched news, run the extractor, link
//! organisations to issuers, classify, extract typed events, then hand the
//! batch to the causal engine. Each news item is one unit of work; its
//! artifacts and outbox events commit in a single transaction.

pub mod aliases;
pub mod classifier;
pub mod extractor;
pub mod linker;

use metrics::{counter, histogram};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EnrichmentConfig;
use crate::enrich::classifier::{Classification, Classifier};
use crate::enrich::extractor::{EntityExtractor, Extraction, ExtractionRequest};
use crate::enrich::linker::{normalize_org_name, Linker};
use crate::error::{PipelineError, PipelineResult};
use crate::events::extractor::EventExtractor;
use crate::events::CegService;
use crate::graph::CegGraph;
use crate::model::{
    EnrichmentStatus, Entity, EntityKind, Issuer, LinkedCompany, News, OutboxEvent, Topic,
};
use crate::shutdown::Shutdown;
use crate::storage::news::NewsRepository;
use crate::storage::refdata::{issuer_from_security, RefDataStore};

pub struct EnrichmentDeps {
    pub repo: NewsRepository,
    pub refdata: RefDataStore,
    pub linker: Linker,
    pub classifier: Classifier,
    pub extractor: Arc<dyn EntityExtractor>,
    pub event_extractor: EventExtractor,
    pub ceg: Arc<CegService>,
    pub graph: Arc<dyn CegGraph>,
    pub cfg: EnrichmentConfig,
    /// Bounded concurrency on the external extractor.
    pub extract_permits: Semaphore,
    pub trust_by_source: HashMap<Uuid, u8>,
    pub shutdown: Shutdown,
}

/// Spawn the bounded worker pool consuming the claim-and-lock iterator.
pub fn spawn_workers(deps: Arc<EnrichmentDeps>, workers: usize) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|worker_id| {
            let deps = deps.clone();
            tokio::spawn(async move {
                run_worker(worker_id, deps).await;
            })
        })
        .collect()
}

async fn run_worker(worker_id: usize, deps: Arc<EnrichmentDeps>) {
    info!(target: "enrich", worker_id, "enrichment worker started");
    loop {
        if deps.shutdown.is_cancelled() {
            break;
        }
        let batch = match deps.repo.claim_unenriched(deps.cfg.claim_batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(target: "enrich", worker_id, error = %e, "claim failed");
                if !deps.shutdown.sleep(Duration::from_secs(deps.cfg.idle_sleep_secs)).await {
                    break;
                }
                continue;
            }
        };
        if batch.is_empty() {
            if !deps.shutdown.sleep(Duration::from_secs(deps.cfg.idle_sleep_secs)).await {
                break;
            }
            continue;
        }
        for news in batch {
            if deps.shutdown.is_cancelled() {
                break;
            }
            let t0 = std::time::Instant::now();
            let news_id = news.id;
            match enrich_one(&deps, news).await {
                Ok(()) => {
                    counter!("enrich_done_total").increment(1);
                }
                Err(e) => {
                    counter!("enrich_failed_total").increment(1);
                    warn!(target: "enrich", news_id = %news_id, error = %e, "enrichment failed");
                    if let Err(e) = fail_news(&deps, news_id).await {
                        warn!(target: "enrich", news_id = %news_id, error = %e, "failure state persist failed");
                    }
                }
            }
            histogram!("enrich_news_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        }
    }
    info!(target: "enrich", worker_id, "enrichment worker stopped");
}

/// Mark a news item failed and emit the failure event; the row itself stays
/// readable.
async fn fail_news(deps: &EnrichmentDeps, news_id: Uuid) -> PipelineResult<()> {
    deps.repo
        .mark_enriched(news_id, None, EnrichmentStatus::Failed)
        .await?;
    deps.repo
        .insert_outbox(&OutboxEvent::pending(
            "news.enriched",
            serde_json::json!({ "news_id": news_id, "status": "failed" }),
        ))
        .await
}

async fn enrich_one(deps: &EnrichmentDeps, news: News) -> PipelineResult<()> {
    // Boundary: nothing to extract from. Done, not failed.
    if news.text.trim().is_empty() {
        deps.repo
            .replace_enrichment(
                news.id,
                &[],
                &[],
                &[],
                &[],
                &[OutboxEvent::pending(
                    "news.enriched",
                    serde_json::json!({ "news_id": news.id, "status": "done", "events": 0 }),
                )],
            )
            .await?;
        return deps
            .repo
            .mark_enriched(news.id, None, EnrichmentStatus::Done)
            .await;
    }

    let trust = deps
        .trust_by_source
        .get(&news.source_id)
        .copied()
        .unwrap_or(5);

    // 1. External extractor, bounded and retried within the budget.
    let extraction = extract_with_budget(deps, &news).await?;

    // 2. Entities.
    let entities = build_entities(news.id, &extraction);

    // 3. Linker per Org mention.
    let (linked, issuers) = link_companies(deps, &news, &extraction).await?;

    // 4. Classifier.
    let linked_for_classify: Vec<(String, Option<String>)> = linked
        .iter()
        .map(|lc| {
            let sector = issuers
                .iter()
                .find(|i| i.id == lc.issuer_id)
                .and_then(|i| i.sector_id.clone());
            (lc.ticker.clone(), sector)
        })
        .collect();
    let classification =
        deps.classifier
            .classify(&news.title, &news.text, &news.lang, &linked_for_classify);
    let topics = build_topics(news.id, &classification);

    // 5. Typed events.
    let mut tickers: Vec<String> = linked.iter().map(|lc| lc.ticker.clone()).collect();
    for company in &extraction.companies {
        if let Some(t) = &company.ticker {
            if !tickers.contains(t) {
                tickers.push(t.clone());
            }
        }
    }
    let events = deps.event_extractor.extract(
        news.id,
        &news.title,
        &news.text,
        news.published_at,
        &extraction,
        &tickers,
        trust,
    );

    // 6. Atomic persistence of all artifacts + their outbox rows.
    let mut outbox = vec![OutboxEvent::pending(
        "news.enriched",
        serde_json::json!({
            "news_id": news.id,
            "status": "done",
            "events": events.len(),
            "linked_companies": linked.len(),
            "news_type": classification.news_type.as_str(),
            "subtype": classification.subtype.as_str(),
        }),
    )];
    for event in &events {
        outbox.push(OutboxEvent::pending(
            "event.created",
            serde_json::json!({
                "event_id": event.id,
                "news_id": news.id,
                "type": event.event_type,
                "ts": event.ts,
                "is_anchor": event.is_anchor,
            }),
        ));
    }
    deps.repo
        .replace_enrichment(news.id, &entities, &linked, &topics, &events, &outbox)
        .await?;

    // 7. Graph projection (news, issuers, ABOUT links).
    if let Err(e) = project_graph(deps, &news, &linked, &issuers).await {
        warn!(target: "enrich", news_id = %news.id, error = %e, "graph projection failed");
    }

    // 8. Causal engine + event studies.
    let full_text = format!("{} {}", news.title, news.text);
    if let Err(e) = deps
        .ceg
        .process_news_events(&news, &events, &full_text, trust)
        .await
    {
        warn!(target: "ceg", news_id = %news.id, error = %e, "ceg update failed");
    }

    deps.repo
        .mark_enriched(news.id, None, EnrichmentStatus::Done)
        .await
}

/// Extractor call with timeout and the retry budget; the last error marks
/// the news failed.
async fn extract_with_budget(deps: &EnrichmentDeps, news: &News) -> PipelineResult<Extraction> {
    let request = ExtractionRequest {
        title: news.title.clone(),
        text: news.text.clone(),
        published_at: news.published_at,
        lang: news.lang.clone(),
    };
    let timeout = Duration::from_secs(deps.cfg.extractor_timeout_secs);
    let mut last_err = PipelineError::Downstream("extractor budget exhausted".into());

    for attempt in 0..deps.cfg.max_retries.max(1) {
        let _permit = deps
            .extract_permits
            .acquire()
            .await
            .map_err(|_| PipelineError::Cancelled)?;
        let result = tokio::select! {
            r = tokio::time::timeout(timeout, deps.extractor.extract(&request)) => r,
            _ = deps.shutdown.cancelled() => return Err(PipelineError::Cancelled),
        };
        match result {
            Ok(Ok(extraction)) => return Ok(extraction),
            Ok(Err(e)) => {
                counter!("enrich_extractor_retries_total").increment(1);
                warn!(target: "enrich", news_id = %news.id, attempt, error = %e, "extractor attempt failed");
                last_err = e;
            }
            Err(_) => {
                counter!("enrich_extractor_retries_total").increment(1);
                warn!(target: "enrich", news_id = %news.id, attempt, "extractor timed out");
                last_err = PipelineError::TransientIo("extractor timeout".into());
            }
        }
    }
    Err(last_err)
}

fn build_entities(news_id: Uuid, extraction: &Extraction) -> Vec<Entity> {
    let mut out = Vec::new();
    for company in &extraction.companies {
        out.push(Entity {
            news_id,
            kind: EntityKind::Org,
            raw_text: company.name.clone(),
            normalized: normalize_org_name(&company.name),
            confidence: extraction.confidence,
            attrs: serde_json::json!({ "ticker": company.ticker }),
        });
    }
    for person in &extraction.people {
        out.push(Entity {
            news_id,
            kind: EntityKind::Person,
            raw_text: person.name.clone(),
            normalized: person.name.to_lowercase(),
            confidence: extraction.confidence,
            attrs: serde_json::json!({
                "position": person.position,
                "company": person.company,
            }),
        });
    }
    for metric in &extraction.financial_metrics {
        let kind = match metric.metric_type.as_str() {
            "money" => EntityKind::Money,
            "percentage" => EntityKind::Percentage,
            _ => EntityKind::Amount,
        };
        out.push(Entity {
            news_id,
            kind,
            raw_text: metric.raw.clone(),
            normalized: metric
                .value
                .map(|v| v.to_string())
                .unwrap_or_else(|| metric.raw.to_lowercase()),
            confidence: extraction.confidence,
            attrs: serde_json::json!({
                "metric_type": metric.metric_type,
                "unit": metric.unit,
                "company": metric.company,
            }),
        });
    }
    out
}

/// Resolve org mentions and make sure every link points at a stored issuer.
async fn link_companies(
    deps: &EnrichmentDeps,
    news: &News,
    extraction: &Extraction,
) -> PipelineResult<(Vec<LinkedCompany>, Vec<Issuer>)> {
    let title_lower = news.title.to_lowercase();
    let mut linked: Vec<LinkedCompany> = Vec::new();
    let mut issuers: Vec<Issuer> = Vec::new();

    for company in &extraction.companies {
        let Some(resolution) = deps.linker.resolve(&company.name).await? else {
            continue;
        };
        if linked.iter().any(|lc| lc.ticker == resolution.ticker) {
            continue;
        }

        // The issuer row must exist before the link commits.
        let issuer = match deps.refdata.issuer_by_ticker(&resolution.ticker).await? {
            Some(existing) => existing,
            None => {
                let skeleton = match &resolution.security {
                    Some(sec) => issuer_from_security(
                        &sec.secid,
                        &sec.name,
                        &sec.shortname,
                        sec.isin.clone(),
                        sec.primary_boardid.clone(),
                        sec.is_traded,
                    ),
                    None => issuer_from_security(
                        &resolution.ticker,
                        &company.name,
                        &company.name,
                        None,
                        None,
                        true,
                    ),
                };
                deps.refdata.upsert_issuer(&skeleton).await?
            }
        };

        let is_primary = title_lower.contains(&company.name.to_lowercase())
            || title_lower.contains(&normalize_org_name(&company.name));
        linked.push(LinkedCompany {
            news_id: news.id,
            issuer_id: issuer.id,
            ticker: resolution.ticker.clone(),
            method: resolution.method,
            score: resolution.score,
            is_primary,
        });
        issuers.push(issuer);
    }
    Ok((linked, issuers))
}

fn build_topics(news_id: Uuid, classification: &Classification) -> Vec<Topic> {
    classification
        .topics
        .iter()
        .take(3)
        .enumerate()
        .map(|(i, (code, confidence))| Topic {
            news_id,
            code: code.clone(),
            confidence: *confidence,
            is_primary: i == 0,
        })
        .collect()
}

async fn project_graph(
    deps: &EnrichmentDeps,
    news: &News,
    linked: &[LinkedCompany],
    issuers: &[Issuer],
) -> PipelineResult<()> {
    deps.graph.merge_news(news).await?;
    for issuer in issuers {
        deps.graph.merge_issuer(issuer).await?;
    }
    for lc in linked {
        deps.graph.link_news_about(news.id, lc.issuer_id, lc.score).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::extractor::{ExtractedCompany, FinancialMetric};

    #[test]
    fn entities_cover_orgs_people_and_metrics() {
        let news_id = Uuid::new_v4();
        let extraction = Extraction {
            companies: vec![ExtractedCompany {
                name: "ПАО Лукойл".into(),
                ticker: Some("LKOH".into()),
            }],
            financial_metrics: vec![
                FinancialMetric {
                    metric_type: "percentage".into(),
                    value: Some(5.0),
                    unit: Some("%".into()),
                    company: None,
                    raw: "5%".into(),
                },
                FinancialMetric {
                    metric_type: "money".into(),
                    value: Some(1.2),
                    unit: Some("млрд руб".into()),
                    company: None,
                    raw: "1,2 млрд руб".into(),
                },
            ],
            confidence: 0.8,
            ..Default::default()
        };
        let entities = build_entities(news_id, &extraction);
        assert_eq!(entities.len(), 3);
        assert!(entities.iter().any(|e| e.kind == EntityKind::Org && e.normalized == "лукойл"));
        assert!(entities.iter().any(|e| e.kind == EntityKind::Percentage));
        assert!(entities.iter().any(|e| e.kind == EntityKind::Money));
        assert!(entities.iter().all(|e| e.news_id == news_id));
    }

    #[test]
    fn topics_cap_at_three_with_single_primary() {
        let classification = Classification {
            sector: None,
            sector_confidence: 0.0,
            country: "RU".into(),
            news_type: classifier::NewsType::Market,
            subtype: classifier::NewsSubtype::Earnings,
            topics: vec![
                ("earnings".into(), 0.8),
                ("dividends".into(), 0.6),
                ("quarterly".into(), 0.6),
                ("extra".into(), 0.5),
            ],
        };
        let topics = build_topics(Uuid::new_v4(), &classification);
        assert_eq!(topics.len(), 3);
        assert!(topics[0].is_primary);
        assert!(!topics[1].is_primary && !topics[2].is_primary);
    }
}
