// src/ingest/scheduler.rs
//! One polling task per enabled source. The task owns the source's parser
//! state: nothing else writes the cursor. Failures follow the error classes:
//! transient errors back off exponentially, not-found/unauthorized pause the
//! source after a bounded number of attempts.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::antispam::AntispamScorer;
use crate::config::IngestConfig;
use crate::error::PipelineResult;
use crate::ingest::types::{AdapterError, SourceAdapter};
use crate::ingest::{backoff_secs, process_batch};
use crate::model::{Source, SourceKind};
use crate::shutdown::Shutdown;
use crate::storage::{MediaFetcher, NewsWriter};

pub struct PollerDeps {
    pub writer: Arc<dyn NewsWriter>,
    pub media: Arc<dyn MediaFetcher>,
    pub scorer: Arc<AntispamScorer>,
    pub channel_adapter: Arc<dyn SourceAdapter>,
    pub html_adapter: Arc<dyn SourceAdapter>,
    pub ingest_cfg: IngestConfig,
    pub shutdown: Shutdown,
}

impl PollerDeps {
    fn adapter_for(&self, kind: SourceKind) -> Arc<dyn SourceAdapter> {
        match kind {
            SourceKind::MessageChannel => self.channel_adapter.clone(),
            SourceKind::Html => self.html_adapter.clone(),
        }
    }
}

/// Spawn a polling loop per source. `poll_interval_secs` comes from the
/// source entry in the config file.
pub fn spawn_pollers(
    sources: Vec<(Source, u64)>,
    deps: Arc<PollerDeps>,
) -> Vec<JoinHandle<()>> {
    sources
        .into_iter()
        .map(|(source, interval_secs)| {
            let deps = deps.clone();
            tokio::spawn(async move {
                run_poller(source, interval_secs, deps).await;
            })
        })
        .collect()
}

async fn run_poller(mut source: Source, interval_secs: u64, deps: Arc<PollerDeps>) {
    let adapter = deps.adapter_for(source.kind);
    let cfg = &deps.ingest_cfg;
    info!(target: "ingest", source = %source.code, kind = adapter.name(), "poller started");

    loop {
        if deps.shutdown.is_cancelled() {
            break;
        }

        // Back-pressure: let enrichment drain before pulling more.
        match deps.writer.unenriched_backlog().await {
            Ok(backlog) => {
                gauge!("ingest_backlog").set(backlog as f64);
                if backlog > cfg.max_backlog {
                    warn!(target: "ingest", source = %source.code, backlog, "backlog over limit, slowing down");
                    if !deps.shutdown.sleep(Duration::from_secs(cfg.backoff_poll_secs)).await {
                        break;
                    }
                    continue;
                }
            }
            Err(e) => {
                warn!(target: "ingest", source = %source.code, error = %e, "backlog check failed");
            }
        }

        let t0 = std::time::Instant::now();
        let cursor = source.parser_state.last_external_id.clone();
        let result = tokio::select! {
            r = adapter.poll(&source, cursor.as_deref()) => r,
            _ = deps.shutdown.cancelled() => break,
        };
        histogram!("ingest_poll_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

        let sleep_secs = match result {
            Ok(batch) => {
                counter!("ingest_items_total").increment(batch.items.len() as u64);
                if batch.malformed > 0 {
                    counter!("ingest_malformed_total").increment(batch.malformed as u64);
                }

                match process_and_commit(&mut source, batch, &deps).await {
                    Ok(()) => interval_secs,
                    Err(e) => {
                        // Cursor not advanced; the next poll re-fetches and
                        // dedup swallows the overlap.
                        warn!(target: "ingest", source = %source.code, error = %e, "batch persist failed");
                        counter!("ingest_source_errors_total").increment(1);
                        backoff_secs(1, cfg.backoff_base_secs, cfg.backoff_cap_secs)
                    }
                }
            }
            Err(e) => {
                counter!("ingest_source_errors_total").increment(1);
                source.parser_state.error_count += 1;
                let n = source.parser_state.error_count;
                save_state(&source, &deps).await;

                match e {
                    AdapterError::NotFound(_) | AdapterError::Unauthorized(_) => {
                        if n >= cfg.max_channel_retries {
                            warn!(target: "ingest", source = %source.code, error = %e, attempts = n,
                                  "marking source unhealthy and pausing");
                            if let Err(e) = deps.writer.set_source_enabled(source.id, false).await {
                                warn!(target: "ingest", source = %source.code, error = %e, "failed to pause source");
                            }
                            break;
                        }
                        backoff_secs(n, cfg.backoff_base_secs, cfg.backoff_cap_secs)
                    }
                    AdapterError::Transient(_) | AdapterError::Malformed(_) => {
                        warn!(target: "ingest", source = %source.code, error = %e, attempt = n, "poll failed, backing off");
                        backoff_secs(n, cfg.backoff_base_secs, cfg.backoff_cap_secs)
                    }
                }
            }
        };

        if !deps
            .shutdown
            .sleep(Duration::from_secs(jittered(sleep_secs)))
            .await
        {
            break;
        }
    }

    info!(target: "ingest", source = %source.code, "poller stopped");
}

/// Up to +20% random jitter so pollers drift apart instead of stampeding
/// their sources in lockstep.
fn jittered(secs: u64) -> u64 {
    let spread = (secs / 5).max(1);
    secs + rand::thread_rng().gen_range(0..spread)
}

async fn process_and_commit(
    source: &mut Source,
    batch: crate::ingest::types::PollBatch,
    deps: &PollerDeps,
) -> PipelineResult<()> {
    let outcome = process_batch(
        source,
        batch.items,
        &deps.scorer,
        deps.media.as_ref(),
        deps.writer.as_ref(),
    )
    .await?;

    if outcome.kept > 0 || outcome.duplicates > 0 {
        info!(
            target: "ingest",
            source = %source.code,
            kept = outcome.kept,
            dedup = outcome.duplicates,
            ads = outcome.ads_flagged,
            "poll flushed"
        );
    }

    // Cursor moves only after a fully successful flush.
    if let Some(cursor) = batch.new_cursor {
        source.parser_state.last_external_id = Some(cursor);
    }
    source.parser_state.last_poll_at = Some(chrono::Utc::now());
    source.parser_state.error_count = 0;
    save_state(source, deps).await;
    Ok(())
}

async fn save_state(source: &Source, deps: &PollerDeps) {
    if let Err(e) = deps
        .writer
        .save_parser_state(source.id, &source.parser_state)
        .await
    {
        warn!(target: "ingest", source = %source.code, error = %e, "parser state save failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_spread() {
        for _ in 0..100 {
            let v = jittered(60);
            assert!((60..72).contains(&v));
        }
        // tiny intervals still make progress
        assert!(jittered(0) <= 1);
    }
}
