//! Operational HTTP surface: liveness, pipeline stats, causal-chain queries.
//! No end-user presentation lives here.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::events::{CegService, ChainDirection};
use crate::storage::news::NewsRepository;
use crate::storage::outbox::OutboxStore;

#[derive(Clone)]
pub struct ApiState {
    pub repo: NewsRepository,
    pub outbox: OutboxStore,
    pub ceg: Arc<CegService>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/stats", get(stats))
        .route("/news", get(search_news))
        .route("/graph/chains", get(chains))
        .layer(Extension(Arc::new(state)))
}

#[derive(Debug, Deserialize)]
struct NewsQuery {
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    ticker: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn search_news(
    Extension(state): Extension<Arc<ApiState>>,
    Query(query): Query<NewsQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let found = state
        .repo
        .search(
            query.q.as_deref(),
            query.ticker.as_deref(),
            None,
            true,
            query.limit.unwrap_or(50).clamp(1, 200),
        )
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    let rendered: Vec<serde_json::Value> = found
        .iter()
        .map(|n| {
            serde_json::json!({
                "id": n.id,
                "title": n.title,
                "published_at": n.published_at,
                "url": n.url,
                "lang": n.lang,
                "enrichment_status": n.enrichment_status.as_str(),
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "news": rendered })))
}

async fn stats(
    Extension(state): Extension<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let news = state
        .repo
        .status_counts()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    let outbox = state
        .outbox
        .status_counts()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    let backlog = state
        .repo
        .unenriched_count()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    Ok(Json(serde_json::json!({
        "news": news.into_iter().collect::<HashMap<String, i64>>(),
        "outbox": outbox.into_iter().collect::<HashMap<String, i64>>(),
        "unenriched_backlog": backlog,
    })))
}

#[derive(Debug, Deserialize)]
struct ChainsQuery {
    root: Uuid,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    depth: Option<usize>,
    #[serde(default)]
    min_confidence: Option<f64>,
}

async fn chains(
    Extension(state): Extension<Arc<ApiState>>,
    Query(q): Query<ChainsQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let direction = match q.direction.as_deref() {
        None | Some("forward") => ChainDirection::Forward,
        Some("backward") => ChainDirection::Backward,
        _ => return Err(StatusCode::BAD_REQUEST),
    };
    let chains = state
        .ceg
        .causal_chains(q.root, direction, q.depth.unwrap_or(3), q.min_confidence)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    let rendered: Vec<Vec<serde_json::Value>> = chains
        .iter()
        .map(|path| {
            path.iter()
                .map(|rec| {
                    serde_json::json!({
                        "cause_id": rec.edge.cause_id,
                        "effect_id": rec.edge.effect_id,
                        "cause_type": rec.cause_type,
                        "effect_type": rec.effect_type,
                        "kind": rec.edge.kind.as_str(),
                        "sign": rec.edge.sign.as_str(),
                        "conf_total": rec.edge.conf_total,
                        "is_retroactive": rec.edge.is_retroactive,
                    })
                })
                .collect()
        })
        .collect();

    Ok(Json(serde_json::json!({ "root": q.root, "chains": rendered })))
}
