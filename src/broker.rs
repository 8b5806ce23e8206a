// src/broker.rs
//! Broker seam for the outbox relay: durable publish of JSON envelopes on
//! named topics. The HTTP implementation POSTs to a gateway endpoint per
//! topic; the in-memory one backs tests and broker-less runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};
use crate::model::Envelope;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Persistent publish; an `Err` means the delivery must be retried.
    async fn publish(&self, topic: &str, envelope: &Envelope) -> PipelineResult<()>;
}

pub struct HttpBroker {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpBroker {
    pub fn new(client: reqwest::Client, base_url: String, timeout_secs: u64) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> PipelineResult<()> {
        self.client
            .post(format!("{}/topics/{}", self.base_url, topic))
            .timeout(self.timeout)
            .json(envelope)
            .send()
            .await?
            .error_for_status()
            .map_err(PipelineError::from)?;
        Ok(())
    }
}

/// Test/local double: records every publish, optionally failing the first
/// `fail_first` calls to exercise retry paths.
#[derive(Default)]
pub struct MemoryBroker {
    published: Mutex<Vec<(String, Envelope)>>,
    fail_first: Mutex<usize>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(n: usize) -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            fail_first: Mutex::new(n),
        }
    }

    pub fn published(&self) -> Vec<(String, Envelope)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> PipelineResult<()> {
        {
            let mut remaining = self.fail_first.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PipelineError::TransientIo("broker unavailable".into()));
            }
        }
        self.published
            .lock()
            .push((topic.to_string(), envelope.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn memory_broker_fails_then_recovers() {
        let broker = MemoryBroker::failing_first(2);
        let env = Envelope {
            kind: "news.created".into(),
            occurred_at: Utc::now(),
            payload: serde_json::json!({"id": 1}),
        };
        assert!(broker.publish("news.created", &env).await.is_err());
        assert!(broker.publish("news.created", &env).await.is_err());
        assert!(broker.publish("news.created", &env).await.is_ok());
        assert_eq!(broker.published().len(), 1);
    }
}
