//! # News Causal Engine, Binary Entrypoint
//! Boots the full pipeline: source pollers with backfill, the enrichment
//! worker pool, the CMNLN causal engine, the outbox relay and the
//! operational HTTP surface (`/health`, `/stats`, `/metrics`, `/graph/chains`).
//!
//! Exit codes: 0 normal, 1 configuration error, 2 storage unreachable,
//! 3 broker unreachable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use news_causal_engine::antispam::AntispamScorer;
use news_causal_engine::api::{self, ApiState};
use news_causal_engine::broker::{Broker, HttpBroker, MemoryBroker};
use news_causal_engine::config::{self, PipelineConfig};
use news_causal_engine::enrich::aliases::{spawn_alias_writer, AliasCache};
use news_causal_engine::enrich::classifier::Classifier;
use news_causal_engine::enrich::extractor::{EntityExtractor, HttpExtractor, RuleBasedExtractor};
use news_causal_engine::enrich::linker::Linker;
use news_causal_engine::enrich::{spawn_workers, EnrichmentDeps};
use news_causal_engine::events::extractor::EventExtractor;
use news_causal_engine::events::study::EventStudyAnalyser;
use news_causal_engine::events::CegService;
use news_causal_engine::graph::{CegGraph, MemoryGraph, Neo4jGraphWriter};
use news_causal_engine::ingest::backfill::spawn_backfills;
use news_causal_engine::ingest::channel::MessageChannelAdapter;
use news_causal_engine::ingest::html::HtmlAdapter;
use news_causal_engine::ingest::scheduler::{spawn_pollers, PollerDeps};
use news_causal_engine::market::{HttpCandleSource, HttpSecuritiesMaster};
use news_causal_engine::metrics::Metrics;
use news_causal_engine::outbox_relay::OutboxRelay;
use news_causal_engine::shutdown;
use news_causal_engine::storage::news::NewsRepository;
use news_causal_engine::storage::outbox::OutboxStore;
use news_causal_engine::storage::refdata::RefDataStore;
use news_causal_engine::storage::{self, HttpMediaFetcher};

const EXIT_CONFIG: i32 = 1;
const EXIT_STORAGE: i32 = 2;
const EXIT_BROKER: i32 = 3;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // --- configuration -----------------------------------------------------
    let cfg = match PipelineConfig::load_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(EXIT_CONFIG);
        }
    };
    let source_entries = match config::load_sources_default() {
        Ok(entries) => entries,
        Err(e) => {
            error!(error = %e, "sources config error");
            std::process::exit(EXIT_CONFIG);
        }
    };
    if source_entries.is_empty() {
        warn!("no sources configured; pipeline will only serve queries");
    }

    let metrics = Metrics::init();

    // --- storage ------------------------------------------------------------
    let pool = match storage::connect(&cfg.storage).await {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "storage unreachable");
            std::process::exit(EXIT_STORAGE);
        }
    };
    if let Err(e) = storage::init_schema(&pool).await {
        error!(error = %e, "schema bootstrap failed");
        std::process::exit(EXIT_STORAGE);
    }
    let repo = NewsRepository::new(pool.clone());
    let refdata = RefDataStore::new(pool.clone());
    let outbox_store = OutboxStore::new(pool);

    match repo.release_stale_claims().await {
        Ok(0) => {}
        Ok(n) => info!(released = n, "returned stale claims to the queue"),
        Err(e) => warn!(error = %e, "stale claim release failed"),
    }

    // --- graph store --------------------------------------------------------
    let graph: Arc<dyn CegGraph> = if cfg.graph.uri.is_empty() {
        warn!("no graph store configured; using the in-memory graph");
        Arc::new(MemoryGraph::new())
    } else {
        match Neo4jGraphWriter::connect(&cfg.graph.uri, &cfg.graph.user, &cfg.graph.password).await
        {
            Ok(writer) => Arc::new(writer),
            Err(e) => {
                error!(error = %e, "graph store unreachable");
                std::process::exit(EXIT_STORAGE);
            }
        }
    };
    if let Err(e) = graph.ensure_constraints().await {
        error!(error = %e, "graph constraints failed");
        std::process::exit(EXIT_STORAGE);
    }

    // --- broker -------------------------------------------------------------
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.http.request_timeout_secs))
        .user_agent("news-causal-engine/0.4")
        .build()
        .expect("reqwest client");

    let broker: Arc<dyn Broker> = if cfg.broker.url.is_empty() {
        warn!("no broker configured; outbox publishes into memory");
        Arc::new(MemoryBroker::new())
    } else {
        // Preflight: any HTTP answer counts as reachable, refused connections abort.
        if let Err(e) = http_client.get(&cfg.broker.url).send().await {
            if e.is_connect() || e.is_timeout() {
                error!(error = %e, "broker unreachable");
                std::process::exit(EXIT_BROKER);
            }
        }
        Arc::new(HttpBroker::new(
            http_client.clone(),
            cfg.broker.url.clone(),
            cfg.broker.timeout_secs,
        ))
    };

    // --- shared services ----------------------------------------------------
    let (shutdown_trigger, shutdown) = shutdown::channel();

    let scorer = match AntispamScorer::from_config(
        cfg.antispam.threshold_default,
        cfg.antispam.threshold_trusted,
        cfg.antispam.rules_path.as_deref().map(std::path::Path::new),
    ) {
        Ok(scorer) => Arc::new(scorer),
        Err(e) => {
            error!(error = %e, "antispam rules error");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let persisted_aliases = refdata.load_aliases().await.unwrap_or_else(|e| {
        warn!(error = %e, "alias load failed; starting from the curated seed");
        Vec::new()
    });
    let (alias_cache, alias_rx) = AliasCache::new(persisted_aliases);
    let alias_writer = spawn_alias_writer(alias_rx, refdata.clone(), shutdown.clone());

    let master = Arc::new(HttpSecuritiesMaster::new(
        http_client.clone(),
        cfg.enrichment.master_url.clone(),
    ));
    let linker = Linker::new(
        alias_cache.clone(),
        master,
        cfg.enrichment.auto_learn_threshold,
    );

    let extractor: Arc<dyn EntityExtractor> = match &cfg.enrichment.extractor_url {
        Some(url) => Arc::new(HttpExtractor::new(
            http_client.clone(),
            url.clone(),
            cfg.enrichment.extractor_timeout_secs,
        )),
        None => {
            warn!("no extractor configured; using the rule-based fallback");
            Arc::new(RuleBasedExtractor)
        }
    };

    let candles = Arc::new(HttpCandleSource::new(
        http_client.clone(),
        cfg.event_study.price_api_url.clone(),
    ));
    let study = EventStudyAnalyser::new(candles, cfg.event_study.clone());
    let ceg = Arc::new(CegService::new(
        cfg.ceg.clone(),
        Arc::new(repo.clone()),
        study,
        graph.clone(),
    ));

    // --- sources ------------------------------------------------------------
    let mut sources = Vec::new();
    for entry in &source_entries {
        match repo.upsert_source(entry).await {
            Ok(source) => sources.push((source, entry.clone())),
            Err(e) => {
                error!(source = %entry.code, error = %e, "source upsert failed");
                std::process::exit(EXIT_STORAGE);
            }
        }
    }
    let trust_by_source: HashMap<_, _> = sources
        .iter()
        .map(|(s, _)| (s.id, s.trust_level))
        .collect();

    // --- workers ------------------------------------------------------------
    let workers = cfg.enrichment_workers();
    let enrich_deps = Arc::new(EnrichmentDeps {
        repo: repo.clone(),
        refdata: refdata.clone(),
        linker,
        classifier: Classifier::new(),
        extractor,
        event_extractor: EventExtractor::new(
            cfg.ceg.anchor_types.clone(),
            cfg.ceg.max_events_per_news,
        ),
        ceg: ceg.clone(),
        graph: graph.clone(),
        cfg: cfg.enrichment.clone(),
        extract_permits: Semaphore::new(workers),
        trust_by_source,
        shutdown: shutdown.clone(),
    });
    let mut handles = spawn_workers(enrich_deps, workers);
    handles.push(alias_writer);

    let poller_deps = Arc::new(PollerDeps {
        writer: Arc::new(repo.clone()),
        media: Arc::new(HttpMediaFetcher::new(http_client.clone())),
        scorer,
        channel_adapter: Arc::new(MessageChannelAdapter::new(
            http_client.clone(),
            source_entries
                .iter()
                .find_map(|e| e.config.get("api_base").and_then(|v| v.as_str()))
                .unwrap_or("http://127.0.0.1:8081")
                .to_string(),
        )),
        html_adapter: Arc::new(HtmlAdapter::new(http_client.clone())),
        ingest_cfg: cfg.ingest.clone(),
        shutdown: shutdown.clone(),
    });

    let enabled: Vec<_> = sources.iter().filter(|(s, _)| s.enabled).collect();
    handles.extend(spawn_pollers(
        enabled
            .iter()
            .map(|(s, e)| (s.clone(), e.poll_interval_secs))
            .collect(),
        poller_deps.clone(),
    ));
    handles.extend(spawn_backfills(
        enabled
            .iter()
            .map(|(s, e)| (s.clone(), e.backfill_days))
            .collect(),
        repo.clone(),
        poller_deps,
    ));

    let relay = OutboxRelay::new(
        outbox_store.clone(),
        broker,
        cfg.outbox.clone(),
        shutdown.clone(),
    );
    handles.push(relay.spawn());

    // --- HTTP surface -------------------------------------------------------
    let app = api::router(ApiState {
        repo: repo.clone(),
        outbox: outbox_store,
        ceg: ceg.clone(),
    })
    .merge(metrics.router());

    let listener = match tokio::net::TcpListener::bind(&cfg.http.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(bind = %cfg.http.bind, error = %e, "http bind failed");
            std::process::exit(EXIT_CONFIG);
        }
    };
    info!(bind = %cfg.http.bind, workers, sources = sources.len(), "pipeline up");

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await;
    });

    // --- lifecycle ----------------------------------------------------------
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested, unwinding");
    shutdown_trigger.trigger();

    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
        let _ = server.await;
    };
    if tokio::time::timeout(Duration::from_secs(20), drain).await.is_err() {
        warn!("tasks did not drain in time; exiting anyway");
    }
    info!("bye");
}
