// src/ingest/backfill.rs
//! Historical backfill: one bounded fetch per source, running alongside live
//! polling. Overlap with the live stream is resolved by dedup, so the two
//! writers never coordinate.

use std::sync::Arc;

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::ingest::process_batch;
use crate::ingest::scheduler::PollerDeps;
use crate::model::{Source, SourceKind};
use crate::storage::news::NewsRepository;

/// Spawn a one-shot backfill task per source that still needs one.
/// `backfill_days` of 0 means the source opted out.
pub fn spawn_backfills(
    sources: Vec<(Source, i64)>,
    repo: NewsRepository,
    deps: Arc<PollerDeps>,
) -> Vec<JoinHandle<()>> {
    sources
        .into_iter()
        .filter(|(source, days)| *days > 0 && !source.parser_state.backfill_completed)
        .map(|(source, days)| {
            let deps = deps.clone();
            let repo = repo.clone();
            tokio::spawn(async move {
                run_backfill(source, days, repo, deps).await;
            })
        })
        .collect()
}

async fn run_backfill(mut source: Source, days: i64, repo: NewsRepository, deps: Arc<PollerDeps>) {
    let horizon = days.min(deps.ingest_cfg.backfill_horizon_cap_days);
    let adapter = match source.kind {
        SourceKind::MessageChannel => deps.channel_adapter.clone(),
        SourceKind::Html => deps.html_adapter.clone(),
    };
    info!(target: "ingest", source = %source.code, horizon_days = horizon, "backfill started");

    let items = tokio::select! {
        r = adapter.backfill(&source, horizon) => match r {
            Ok(items) => items,
            Err(e) => {
                warn!(target: "ingest", source = %source.code, error = %e, "backfill fetch failed; will retry next start");
                return;
            }
        },
        _ = deps.shutdown.cancelled() => return,
    };

    counter!("ingest_items_total").increment(items.len() as u64);
    let total = items.len();

    match process_batch(
        &source,
        items,
        &deps.scorer,
        deps.media.as_ref(),
        deps.writer.as_ref(),
    )
    .await
    {
        Ok(outcome) => {
            source.parser_state.backfill_completed = true;
            if let Err(e) = repo.mark_backfill_completed(source.id).await {
                warn!(target: "ingest", source = %source.code, error = %e, "backfill flag save failed");
            }
            info!(
                target: "ingest",
                source = %source.code,
                fetched = total,
                kept = outcome.kept,
                dedup = outcome.duplicates,
                "backfill complete"
            );
        }
        Err(e) => {
            warn!(target: "ingest", source = %source.code, error = %e, "backfill persist failed; flag left unset");
        }
    }
}
