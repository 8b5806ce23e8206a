// src/ingest/channel.rs
//! Message-channel adapter: pulls posts from a channel-gateway JSON API
//! (one gateway fronts all subscribed channels; the source locator is the
//! channel handle). Emits items oldest-first so the cursor only moves forward.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::antispam::ItemShape;
use crate::ingest::types::{AdapterError, FetchedItem, PollBatch, SourceAdapter};
use crate::model::{RawNews, Source};

const PAGE_LIMIT: u32 = 100;
const BACKFILL_MAX_PAGES: u32 = 200;

pub struct MessageChannelAdapter {
    client: reqwest::Client,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct ChannelMessage {
    id: i64,
    /// Unix seconds.
    date: i64,
    #[serde(default)]
    text: String,
    #[serde(default)]
    urls: Vec<String>,
    #[serde(default)]
    hashtags: Vec<String>,
    #[serde(default)]
    forwarded_from: Option<String>,
    #[serde(default)]
    media: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    messages: Vec<ChannelMessage>,
}

impl MessageChannelAdapter {
    pub fn new(client: reqwest::Client, api_base: String) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_page(
        &self,
        channel: &str,
        after_id: Option<i64>,
        before_id: Option<i64>,
    ) -> Result<Vec<ChannelMessage>, AdapterError> {
        let mut req = self
            .client
            .get(format!("{}/channels/{}/messages", self.api_base, channel))
            .query(&[("limit", PAGE_LIMIT.to_string())]);
        if let Some(after) = after_id {
            req = req.query(&[("after_id", after.to_string())]);
        }
        if let Some(before) = before_id {
            req = req.query(&[("before_id", before.to_string())]);
        }
        let resp = req
            .send()
            .await
            .map_err(AdapterError::from_http)?
            .error_for_status()
            .map_err(AdapterError::from_http)?;
        let body: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| AdapterError::Malformed(format!("channel response: {e}")))?;
        Ok(body.messages)
    }

    fn convert(&self, source: &Source, msg: ChannelMessage) -> Option<FetchedItem> {
        if msg.text.trim().is_empty() {
            return None;
        }
        let published_at = Utc.timestamp_opt(msg.date, 0).single()?;
        let title = first_line(&msg.text);
        let shape = ItemShape {
            urls: msg.urls.clone(),
            hashtags: msg.hashtags.clone(),
            forwarded_from: msg.forwarded_from.clone(),
        };
        Some(FetchedItem {
            raw: RawNews {
                source_id: source.id,
                external_id: msg.id.to_string(),
                title,
                text: msg.text,
                summary: None,
                published_at,
                url: None,
                media_refs: msg.media,
                raw_meta: serde_json::json!({
                    "channel": source.base_locator,
                    "forwarded_from": msg.forwarded_from,
                }),
            },
            shape,
        })
    }
}

/// First non-empty line, clipped to a headline-sized prefix.
fn first_line(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    if line.chars().count() > 160 {
        let clipped: String = line.chars().take(160).collect();
        format!("{clipped}…")
    } else {
        line.to_string()
    }
}

#[async_trait]
impl SourceAdapter for MessageChannelAdapter {
    async fn poll(&self, source: &Source, cursor: Option<&str>) -> Result<PollBatch, AdapterError> {
        let after_id = cursor.and_then(|c| c.parse::<i64>().ok());
        let mut messages = self.fetch_page(&source.base_locator, after_id, None).await?;
        messages.sort_by_key(|m| (m.date, m.id));

        let mut batch = PollBatch::default();
        let mut max_id = after_id.unwrap_or(0);
        for msg in messages {
            let id = msg.id;
            match self.convert(source, msg) {
                Some(item) => batch.items.push(item),
                None => {
                    batch.malformed += 1;
                    warn!(target: "ingest", source = %source.code, msg_id = id, "skipping malformed channel message");
                }
            }
            max_id = max_id.max(id);
        }
        if max_id > after_id.unwrap_or(0) {
            batch.new_cursor = Some(max_id.to_string());
        }
        Ok(batch)
    }

    async fn backfill(
        &self,
        source: &Source,
        horizon_days: i64,
    ) -> Result<Vec<FetchedItem>, AdapterError> {
        let horizon: DateTime<Utc> = Utc::now() - Duration::days(horizon_days);
        let mut out = Vec::new();
        let mut before_id: Option<i64> = None;

        for _ in 0..BACKFILL_MAX_PAGES {
            let page = self
                .fetch_page(&source.base_locator, None, before_id)
                .await?;
            if page.is_empty() {
                break;
            }
            let oldest = page.iter().map(|m| m.id).min().unwrap_or(0);
            let reached_horizon = page
                .iter()
                .any(|m| Utc.timestamp_opt(m.date, 0).single().map(|t| t < horizon) == Some(true));

            for msg in page {
                let ts_ok = Utc
                    .timestamp_opt(msg.date, 0)
                    .single()
                    .map(|t| t >= horizon)
                    .unwrap_or(false);
                if !ts_ok {
                    continue;
                }
                if let Some(item) = self.convert(source, msg) {
                    out.push(item);
                }
            }

            if reached_horizon {
                break;
            }
            before_id = Some(oldest);
        }

        // Published-at order for downstream cursor discipline.
        out.sort_by(|a, b| a.raw.published_at.cmp(&b.raw.published_at));
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "message_channel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_line_picks_headline() {
        assert_eq!(first_line("\n\n  ЦБ повысил ставку\nподробности"), "ЦБ повысил ставку");
        let long = "а".repeat(300);
        assert!(first_line(&long).chars().count() <= 161);
    }

    #[test]
    fn channel_message_deserializes_with_defaults() {
        let json = r#"{"id": 42, "date": 1735725600, "text": "Рубль укрепился"}"#;
        let msg: ChannelMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, 42);
        assert!(msg.urls.is_empty());
        assert!(msg.forwarded_from.is_none());
    }
}
