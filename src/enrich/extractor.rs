// src/enrich/extractor.rs
//! Entity-extractor seam (§ external collaborators). The pipeline only sees
//! the `EntityExtractor` trait and the `Extraction` record. The HTTP client
//! fronts the real model service; `RuleBasedExtractor` is the deterministic
//! local fallback used when no service is configured and by tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedCompany {
    pub name: String,
    #[serde(default)]
    pub ticker: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedPerson {
    pub name: String,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedMarket {
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub change: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinancialMetric {
    pub metric_type: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    pub raw: String,
}

/// Structured result of one extraction call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub companies: Vec<ExtractedCompany>,
    #[serde(default)]
    pub people: Vec<ExtractedPerson>,
    #[serde(default)]
    pub markets: Vec<ExtractedMarket>,
    #[serde(default)]
    pub financial_metrics: Vec<FinancialMetric>,
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub is_anchor: Option<bool>,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub is_advertisement: bool,
    #[serde(default)]
    pub content_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionRequest {
    pub title: String,
    pub text: String,
    pub published_at: DateTime<Utc>,
    pub lang: String,
}

#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, req: &ExtractionRequest) -> PipelineResult<Extraction>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpExtractor {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpExtractor {
    pub fn new(client: reqwest::Client, url: String, timeout_secs: u64) -> Self {
        Self {
            client,
            url,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl EntityExtractor for HttpExtractor {
    async fn extract(&self, req: &ExtractionRequest) -> PipelineResult<Extraction> {
        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        resp.json::<Extraction>()
            .await
            .map_err(|e| PipelineError::Downstream(format!("extractor response: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Deterministic local fallback
// ---------------------------------------------------------------------------

static RE_QUOTED_ORG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([А-ЯЁA-Z][^"]{1,40})""#).unwrap());
static RE_LEGAL_ORG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:ПАО|ОАО|АО|ООО|Группа|ГК|Банк)\s+([А-ЯЁ][А-Яа-яёЁ0-9]+(?:\s+[А-ЯЁ][А-Яа-яёЁ0-9]+)?)").unwrap()
});
static RE_TICKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([A-Z]{4,5})\b").unwrap());
static RE_PERSON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(глава|директор|президент|председатель|гендиректор)\s+([А-ЯЁ][а-яё]+\s+[А-ЯЁ][а-яё]+)").unwrap()
});
static RE_MONEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*(млрд|млн|тыс)?\.?\s*(руб|рубл|долл|евро)").unwrap()
});
static RE_PERCENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(?:[.,]\d+)?)\s*%").unwrap());

/// Regex-driven fallback extractor: same contract, deterministic output.
/// Capitalized-organisation and metric patterns only, no model calls.
pub struct RuleBasedExtractor;

#[async_trait]
impl EntityExtractor for RuleBasedExtractor {
    async fn extract(&self, req: &ExtractionRequest) -> PipelineResult<Extraction> {
        let full = format!("{} {}", req.title, req.text);
        let mut out = Extraction {
            confidence: 0.6,
            ..Default::default()
        };

        let mut seen = std::collections::BTreeSet::new();
        for caps in RE_LEGAL_ORG.captures_iter(&full) {
            if let Some(name) = caps.get(1) {
                let name = name.as_str().trim().to_string();
                if seen.insert(name.to_lowercase()) {
                    out.companies.push(ExtractedCompany { name, ticker: None });
                }
            }
        }
        for caps in RE_QUOTED_ORG.captures_iter(&full) {
            if let Some(name) = caps.get(1) {
                let name = name.as_str().trim().to_string();
                // quoted fragments that look like sentences are not org names
                if name.split_whitespace().count() <= 3 && seen.insert(name.to_lowercase()) {
                    out.companies.push(ExtractedCompany { name, ticker: None });
                }
            }
        }
        for caps in RE_TICKER.captures_iter(&full) {
            let ticker = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
            if seen.insert(ticker.to_lowercase()) {
                out.companies.push(ExtractedCompany {
                    name: ticker.clone(),
                    ticker: Some(ticker),
                });
            }
        }

        for caps in RE_PERSON.captures_iter(&full) {
            let position = caps.get(1).map(|m| m.as_str().to_lowercase());
            if let Some(name) = caps.get(2) {
                out.people.push(ExtractedPerson {
                    name: name.as_str().to_string(),
                    position,
                    company: None,
                });
            }
        }

        for caps in RE_MONEY.captures_iter(&full) {
            let raw = caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default();
            let value = caps
                .get(1)
                .and_then(|m| m.as_str().replace(',', ".").parse::<f64>().ok());
            let unit = caps.get(3).map(|m| m.as_str().to_lowercase());
            out.financial_metrics.push(FinancialMetric {
                metric_type: "money".into(),
                value,
                unit,
                company: None,
                raw,
            });
        }
        for caps in RE_PERCENT.captures_iter(&full) {
            let raw = caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default();
            let value = caps
                .get(1)
                .and_then(|m| m.as_str().replace(',', ".").parse::<f64>().ok());
            out.financial_metrics.push(FinancialMetric {
                metric_type: "percentage".into(),
                value,
                unit: Some("%".into()),
                company: None,
                raw,
            });
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(title: &str, text: &str) -> ExtractionRequest {
        ExtractionRequest {
            title: title.into(),
            text: text.into(),
            published_at: Utc::now(),
            lang: "ru".into(),
        }
    }

    #[tokio::test]
    async fn extracts_orgs_tickers_and_metrics() {
        let e = RuleBasedExtractor;
        let out = e
            .extract(&req(
                "ПАО Лукойл отчиталось о прибыли",
                "Чистая прибыль выросла на 15,5% и достигла 1,2 млрд руб. Акции LKOH растут.",
            ))
            .await
            .unwrap();

        assert!(out.companies.iter().any(|c| c.name == "Лукойл"));
        assert!(out
            .companies
            .iter()
            .any(|c| c.ticker.as_deref() == Some("LKOH")));
        assert!(out
            .financial_metrics
            .iter()
            .any(|m| m.metric_type == "percentage" && m.value == Some(15.5)));
        assert!(out
            .financial_metrics
            .iter()
            .any(|m| m.metric_type == "money" && m.value == Some(1.2)));
    }

    #[tokio::test]
    async fn extracts_person_with_position() {
        let e = RuleBasedExtractor;
        let out = e
            .extract(&req(
                "Смена руководства",
                "Глава Иван Петров покинул пост по собственному желанию.",
            ))
            .await
            .unwrap();
        assert_eq!(out.people.len(), 1);
        assert_eq!(out.people[0].name, "Иван Петров");
        assert_eq!(out.people[0].position.as_deref(), Some("глава"));
    }

    #[tokio::test]
    async fn deterministic_across_runs() {
        let e = RuleBasedExtractor;
        let r = req("ПАО Газпром", "Добыча выросла на 3%. Акции GAZP в плюсе.");
        let a = e.extract(&r).await.unwrap();
        let b = e.extract(&r).await.unwrap();
        assert_eq!(serde_json::to_value(&a).unwrap(), serde_json::to_value(&b).unwrap());
    }

    #[tokio::test]
    async fn empty_text_extracts_nothing() {
        let e = RuleBasedExtractor;
        let out = e.extract(&req("", "")).await.unwrap();
        assert!(out.companies.is_empty());
        assert!(out.people.is_empty());
        assert!(out.financial_metrics.is_empty());
    }
}
