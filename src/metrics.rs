//! Prometheus recorder + one-time series registration.

use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and describe every series the pipeline
    /// emits, so they all show up on `/metrics` from the first scrape.
    pub fn init() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("prometheus: install recorder");

        describe_counter!("ingest_items_total", "Raw items fetched from sources.");
        describe_counter!("ingest_kept_total", "Items persisted after dedup.");
        describe_counter!(
            "ingest_duplicates_total",
            "Items dropped by hash/external-id dedup."
        );
        describe_counter!("ingest_malformed_total", "Items dropped as malformed.");
        describe_counter!("ingest_ads_total", "Items flagged as advertising.");
        describe_counter!("ingest_source_errors_total", "Adapter poll errors.");
        describe_gauge!("ingest_backlog", "Unenriched news backlog.");
        describe_histogram!("ingest_poll_ms", "Source poll duration in milliseconds.");

        describe_counter!("enrich_done_total", "News enriched successfully.");
        describe_counter!(
            "enrich_failed_total",
            "News moved to failed after the retry budget."
        );
        describe_counter!("enrich_extractor_retries_total", "Extractor retry attempts.");
        describe_histogram!("enrich_news_ms", "Per-news enrichment duration.");

        describe_counter!("linker_resolved_total", "Org mentions resolved to an issuer.");
        describe_counter!("linker_unresolved_total", "Org mentions left unresolved.");
        describe_counter!(
            "linker_auto_learned_total",
            "Aliases learned from master search."
        );

        describe_counter!("ceg_events_total", "Events extracted.");
        describe_counter!("ceg_edges_upserted_total", "CAUSES edges created or re-scored.");
        describe_counter!("ceg_edges_dropped_total", "CAUSES edges deleted below threshold.");
        describe_counter!("ceg_retro_links_total", "Retroactive CAUSES edges.");
        describe_counter!("ceg_impacts_total", "Significant IMPACTS edges.");
        describe_gauge!("ceg_last_importance", "Importance score of the last scored event.");

        describe_counter!("outbox_published_total", "Outbox rows published to the broker.");
        describe_counter!("outbox_retries_total", "Outbox publish retries scheduled.");
        describe_counter!("outbox_dead_lettered_total", "Outbox rows dead-lettered.");
        describe_counter!("outbox_purged_total", "Sent outbox rows purged.");
        describe_gauge!("outbox_pending", "Pending outbox rows at last relay pass.");

        Self { handle }
    }

    /// `/metrics` in Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
