// src/market/master.rs
//! Securities-master search client. The linker consumes only the trait; the
//! HTTP implementation talks to the exchange reference API and caches
//! responses per normalized query.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::PipelineResult;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SecurityRecord {
    pub secid: String,
    #[serde(default)]
    pub isin: Option<String>,
    #[serde(default)]
    pub shortname: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_traded: bool,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub primary_boardid: Option<String>,
}

#[async_trait]
pub trait SecuritiesMaster: Send + Sync {
    async fn search(&self, query: &str) -> PipelineResult<Vec<SecurityRecord>>;
}

pub struct HttpSecuritiesMaster {
    client: reqwest::Client,
    base_url: String,
    cache: RwLock<HashMap<String, Vec<SecurityRecord>>>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    securities: Vec<SecurityRecord>,
}

impl HttpSecuritiesMaster {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SecuritiesMaster for HttpSecuritiesMaster {
    async fn search(&self, query: &str) -> PipelineResult<Vec<SecurityRecord>> {
        let key = query.trim().to_lowercase();
        if let Some(hit) = self.cache.read().get(&key) {
            return Ok(hit.clone());
        }

        let resp = self
            .client
            .get(format!("{}/securities/search", self.base_url))
            .query(&[("query", query), ("limit", "10")])
            .send()
            .await?
            .error_for_status()?;
        let body: SearchResponse = resp.json().await.map_err(crate::error::PipelineError::from)?;

        self.cache.write().insert(key, body.securities.clone());
        Ok(body.securities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_response_deserializes() {
        let json = r#"{"securities": [
            {"secid": "LKOH", "isin": "RU0009024277", "shortname": "ЛУКОЙЛ",
             "name": "Нефтяная компания ЛУКОЙЛ", "is_traded": true,
             "market": "shares", "primary_boardid": "TQBR"}
        ]}"#;
        let parsed: SearchResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.securities[0].secid, "LKOH");
        assert!(parsed.securities[0].is_traded);
    }
}
