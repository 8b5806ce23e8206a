// src/ingest/html.rs
//! HTML source adapter. Each publisher family is a strategy, a record of
//! functions `{list_urls, parse_article}` registered under the source code,
//! so adding a site is one registry entry, not a new type.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::antispam::ItemShape;
use crate::ingest::normalize_text;
use crate::ingest::types::{AdapterError, FetchedItem, PollBatch, SourceAdapter};
use crate::model::{RawNews, Source};

const POLL_ARTICLE_CAP: usize = 20;
const BACKFILL_ARTICLE_CAP: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedArticle {
    pub title: String,
    pub text: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Per-publisher parsing strategy.
pub struct HtmlStrategy {
    pub code: &'static str,
    /// Extract article URLs from a listing page, newest first.
    pub list_urls: fn(listing_html: &str, base_url: &str) -> Vec<String>,
    /// Parse one article page; `None` = malformed item (skipped, counted).
    pub parse_article: fn(article_html: &str) -> Option<ParsedArticle>,
}

static STRATEGIES: &[HtmlStrategy] = &[
    HtmlStrategy {
        code: "interfax",
        list_urls: interfax_list_urls,
        parse_article: generic_parse_article,
    },
    HtmlStrategy {
        code: "generic",
        list_urls: generic_list_urls,
        parse_article: generic_parse_article,
    },
];

/// Strategy registry lookup; unknown codes fall back to the generic parser.
pub fn strategy_for(code: &str) -> &'static HtmlStrategy {
    STRATEGIES
        .iter()
        .find(|s| s.code == code)
        .unwrap_or_else(|| STRATEGIES.last().expect("generic strategy present"))
}

// -- strategies ---------------------------------------------------------------

static RE_HREF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<a[^>]+href\s*=\s*["']([^"'#]+)["']"#).unwrap());
static RE_TITLE_H1: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<h1[^>]*>(.*?)</h1>").unwrap());
static RE_TITLE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());
static RE_PARAGRAPH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<p[^>]*>(.*?)</p>").unwrap());
static RE_TIME_META: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(?:property|name)\s*=\s*["']article:published_time["'][^>]*content\s*=\s*["']([^"']+)["']"#,
    )
    .unwrap()
});
static RE_TIME_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<time[^>]+datetime\s*=\s*["']([^"']+)["']"#).unwrap());
static RE_INTERFAX_ARTICLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/(?:business|russia|world)/\d+").unwrap());

fn interfax_list_urls(listing_html: &str, base_url: &str) -> Vec<String> {
    collect_links(listing_html, base_url, |path| {
        RE_INTERFAX_ARTICLE.is_match(path)
    })
}

fn generic_list_urls(listing_html: &str, base_url: &str) -> Vec<String> {
    // Heuristic: same-site links whose path carries a numeric article id.
    static RE_NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"/\d{4,}").unwrap());
    collect_links(listing_html, base_url, |path| RE_NUMERIC.is_match(path))
}

fn collect_links(html: &str, base_url: &str, keep: fn(&str) -> bool) -> Vec<String> {
    let origin = url_origin(base_url);
    let mut out = Vec::new();
    for caps in RE_HREF.captures_iter(html) {
        let href = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let absolute = if href.starts_with("http://") || href.starts_with("https://") {
            if !href.starts_with(&origin) {
                continue;
            }
            href.to_string()
        } else if href.starts_with('/') {
            format!("{origin}{href}")
        } else {
            continue;
        };
        let path = absolute.strip_prefix(&origin).unwrap_or(&absolute);
        if keep(path) && !out.contains(&absolute) {
            out.push(absolute);
        }
    }
    out
}

fn generic_parse_article(html: &str) -> Option<ParsedArticle> {
    let title_raw = RE_TITLE_H1
        .captures(html)
        .or_else(|| RE_TITLE_TAG.captures(html))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())?;
    let title = normalize_text(&title_raw);

    let mut paragraphs = Vec::new();
    for caps in RE_PARAGRAPH.captures_iter(html) {
        if let Some(p) = caps.get(1) {
            let text = normalize_text(p.as_str());
            if text.chars().count() >= 40 {
                paragraphs.push(text);
            }
        }
    }
    if title.is_empty() || paragraphs.is_empty() {
        return None;
    }

    let published_at = RE_TIME_META
        .captures(html)
        .or_else(|| RE_TIME_TAG.captures(html))
        .and_then(|c| c.get(1))
        .and_then(|m| DateTime::parse_from_rfc3339(m.as_str()).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Some(ParsedArticle {
        title,
        text: paragraphs.join("\n"),
        published_at,
    })
}

fn url_origin(url: &str) -> String {
    // scheme://host, no trailing slash
    if let Some(scheme_end) = url.find("://") {
        let rest = &url[scheme_end + 3..];
        let host_end = rest.find('/').unwrap_or(rest.len());
        format!("{}{}", &url[..scheme_end + 3], &rest[..host_end])
    } else {
        url.trim_end_matches('/').to_string()
    }
}

// -- adapter ------------------------------------------------------------------

pub struct HtmlAdapter {
    client: reqwest::Client,
}

impl HtmlAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch(&self, url: &str) -> Result<String, AdapterError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(AdapterError::from_http)?
            .error_for_status()
            .map_err(AdapterError::from_http)?;
        resp.text()
            .await
            .map_err(|e| AdapterError::Malformed(format!("body read: {e}")))
    }

    async fn fetch_articles(
        &self,
        source: &Source,
        urls: &[String],
    ) -> (Vec<FetchedItem>, usize) {
        let strategy = strategy_for(&source.code);
        let mut items = Vec::new();
        let mut malformed = 0usize;

        for url in urls {
            let html = match self.fetch(url).await {
                Ok(h) => h,
                Err(e) => {
                    malformed += 1;
                    warn!(target: "ingest", source = %source.code, url = %url, error = %e, "article fetch failed");
                    continue;
                }
            };
            match (strategy.parse_article)(&html) {
                Some(article) => items.push(FetchedItem {
                    raw: RawNews {
                        source_id: source.id,
                        external_id: url.clone(),
                        title: article.title,
                        text: article.text,
                        summary: None,
                        published_at: article.published_at.unwrap_or_else(Utc::now),
                        url: Some(url.clone()),
                        media_refs: Vec::new(),
                        raw_meta: serde_json::json!({ "strategy": strategy.code }),
                    },
                    shape: ItemShape::default(),
                }),
                None => {
                    malformed += 1;
                    warn!(target: "ingest", source = %source.code, url = %url, "article parse failed");
                }
            }
        }
        (items, malformed)
    }
}

#[async_trait]
impl SourceAdapter for HtmlAdapter {
    async fn poll(&self, source: &Source, cursor: Option<&str>) -> Result<PollBatch, AdapterError> {
        let strategy = strategy_for(&source.code);
        let listing = self.fetch(&source.base_locator).await?;
        let all_urls = (strategy.list_urls)(&listing, &source.base_locator);
        if all_urls.is_empty() {
            return Err(AdapterError::Malformed("listing yielded no article links".into()));
        }

        // Listing is newest first; stop at the cursor, then emit oldest first.
        let fresh: Vec<String> = all_urls
            .into_iter()
            .take_while(|u| Some(u.as_str()) != cursor)
            .take(POLL_ARTICLE_CAP)
            .collect();
        let newest = fresh.first().cloned();
        let ordered: Vec<String> = fresh.into_iter().rev().collect();

        let (mut items, malformed) = self.fetch_articles(source, &ordered).await;
        items.sort_by(|a, b| a.raw.published_at.cmp(&b.raw.published_at));

        Ok(PollBatch {
            items,
            new_cursor: newest,
            malformed,
        })
    }

    async fn backfill(
        &self,
        source: &Source,
        horizon_days: i64,
    ) -> Result<Vec<FetchedItem>, AdapterError> {
        let strategy = strategy_for(&source.code);
        let horizon = Utc::now() - Duration::days(horizon_days);

        let listing = self.fetch(&source.base_locator).await?;
        let urls: Vec<String> = (strategy.list_urls)(&listing, &source.base_locator)
            .into_iter()
            .take(BACKFILL_ARTICLE_CAP)
            .collect();

        let (mut items, _malformed) = self.fetch_articles(source, &urls).await;
        items.retain(|i| i.raw.published_at >= horizon);
        items.sort_by(|a, b| a.raw.published_at.cmp(&b.raw.published_at));
        Ok(items)
    }

    fn name(&self) -> &'static str {
        "html"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"
        <html><body>
        <a href="/business/912345">Новость 1</a>
        <a href="/business/912344">Новость 2</a>
        <a href="/about">Не новость</a>
        <a href="https://other.site/business/1">Чужой сайт</a>
        </body></html>
    "#;

    const ARTICLE: &str = r#"
        <html><head>
        <title>fallback</title>
        <meta property="article:published_time" content="2025-03-01T10:00:00+03:00"/>
        </head><body>
        <h1>ЦБ повысил ключевую ставку до 16%</h1>
        <p>Совет директоров Банка России принял решение повысить ключевую ставку на 100 базисных пунктов.</p>
        <p>Решение вступает в силу немедленно, следующее заседание запланировано на февраль.</p>
        <p>коротко</p>
        </body></html>
    "#;

    #[test]
    fn interfax_listing_extracts_same_site_article_links() {
        let urls = interfax_list_urls(LISTING, "https://www.interfax.ru/business/");
        assert_eq!(
            urls,
            vec![
                "https://www.interfax.ru/business/912345".to_string(),
                "https://www.interfax.ru/business/912344".to_string(),
            ]
        );
    }

    #[test]
    fn article_parses_title_body_and_time() {
        let article = generic_parse_article(ARTICLE).unwrap();
        assert_eq!(article.title, "ЦБ повысил ключевую ставку до 16%");
        // the short paragraph is dropped
        assert_eq!(article.text.lines().count(), 2);
        let ts = article.published_at.unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-03-01T07:00:00+00:00");
    }

    #[test]
    fn article_without_body_is_malformed() {
        assert!(generic_parse_article("<h1>Заголовок</h1>").is_none());
    }

    #[test]
    fn unknown_code_falls_back_to_generic() {
        assert_eq!(strategy_for("nosuch").code, "generic");
        assert_eq!(strategy_for("interfax").code, "interfax");
    }

    #[test]
    fn origin_extraction() {
        assert_eq!(url_origin("https://a.ru/b/c"), "https://a.ru");
        assert_eq!(url_origin("https://a.ru"), "https://a.ru");
    }
}
