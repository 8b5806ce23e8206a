// src/outbox_relay.rs
//! Transactional-outbox relay: drains Pending rows to the broker with
//! exponential backoff and dead-lettering. Rows are claimed skip-locked, so
//! extra relay loops scale out without double publishing; the publish +
//! status update of one batch commits as one transaction.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::config::OutboxConfig;
use crate::error::PipelineResult;
use crate::model::{Envelope, OutboxStatus};
use crate::shutdown::Shutdown;
use crate::storage::outbox::OutboxStore;

pub struct OutboxRelay {
    store: OutboxStore,
    broker: Arc<dyn Broker>,
    cfg: OutboxConfig,
    shutdown: Shutdown,
}

impl OutboxRelay {
    pub fn new(
        store: OutboxStore,
        broker: Arc<dyn Broker>,
        cfg: OutboxConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            store,
            broker,
            cfg,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(target: "outbox", "relay started");
        let mut purge_tick = 0u32;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.process_batch().await {
                Ok(processed) => {
                    if let Ok(pending) = self.store.pending_count().await {
                        gauge!("outbox_pending").set(pending as f64);
                    }
                    // drain fast while there is work, poll slowly when idle
                    if processed == 0
                        && !self
                            .shutdown
                            .sleep(Duration::from_secs(self.cfg.poll_interval_secs))
                            .await
                    {
                        break;
                    }
                }
                Err(e) => {
                    warn!(target: "outbox", error = %e, "relay batch failed");
                    if !self
                        .shutdown
                        .sleep(Duration::from_secs(self.cfg.poll_interval_secs))
                        .await
                    {
                        break;
                    }
                }
            }

            // Retention pass roughly once an hour of idle polls.
            purge_tick += 1;
            if purge_tick >= 720 {
                purge_tick = 0;
                match self.store.purge_sent(self.cfg.keep_days, Utc::now()).await {
                    Ok(purged) if purged > 0 => {
                        counter!("outbox_purged_total").increment(purged);
                        info!(target: "outbox", purged, "purged sent rows");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(target: "outbox", error = %e, "purge failed"),
                }
            }
        }
        info!(target: "outbox", "relay stopped");
    }

    /// Claim one due batch, publish, and commit the status changes.
    pub async fn process_batch(&self) -> PipelineResult<usize> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let batch = self
            .store
            .claim_due(&mut tx, now, self.cfg.batch_size)
            .await?;
        if batch.is_empty() {
            tx.commit().await.map_err(crate::error::PipelineError::from)?;
            return Ok(0);
        }

        let mut processed = 0usize;
        for row in &batch {
            let envelope = Envelope {
                kind: row.topic.clone(),
                occurred_at: row.created_at,
                payload: row.payload.clone(),
            };
            match self.broker.publish(&row.topic, &envelope).await {
                Ok(()) => {
                    self.store.mark_sent(&mut tx, row.id, Utc::now()).await?;
                    counter!("outbox_published_total").increment(1);
                    processed += 1;
                }
                Err(e) => {
                    let status = self
                        .store
                        .mark_failed(
                            &mut tx,
                            row.id,
                            row.retries,
                            self.cfg.max_retries,
                            self.cfg.base_retry_seconds,
                            Utc::now(),
                        )
                        .await?;
                    match status {
                        OutboxStatus::DeadLettered => {
                            counter!("outbox_dead_lettered_total").increment(1);
                            warn!(target: "outbox", id = %row.id, topic = %row.topic, error = %e,
                                  "dead-lettered after retry budget");
                        }
                        _ => {
                            counter!("outbox_retries_total").increment(1);
                            warn!(target: "outbox", id = %row.id, topic = %row.topic, error = %e,
                                  retries = row.retries + 1, "publish failed, retry scheduled");
                        }
                    }
                }
            }
        }
        tx.commit().await.map_err(crate::error::PipelineError::from)?;
        Ok(processed)
    }
}
