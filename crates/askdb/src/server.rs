//! Server startup: builds the metadata store, registry, history and
//! cache subsystems, starts the embedding drain and the worker pool,
//! then serves the HTTP contract.

use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{router, AppState};
use crate::broker::Broker;
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::controller::RunController;
use crate::history::{
    spawn_embedding_worker, EmbeddingStore, HistoryConfig, HistoryService, HttpEmbedder,
};
use crate::llm::HttpModelClient;
use crate::registry::ObjectRegistry;
use crate::store::MetaStore;
use crate::validation::ValidationHarness;
use crate::worker::{spawn_workers, WorkerDeps};

pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();

    let store = Arc::new(MetaStore::new(&cfg.database_url)?);

    let embeddings = Arc::new(EmbeddingStore::new(store.pool()));
    if let Err(e) = embeddings.initialize_index(&cfg.embedding_model) {
        warn!("Embedding index build failed, linear search until restart: {}", e);
    }

    let embedder = Arc::new(HttpEmbedder::new(
        cfg.embedder_base_url.clone(),
        cfg.llm_api_key.clone(),
        cfg.embedding_model.clone(),
    ));
    let (embed_tx, _embed_handle) = spawn_embedding_worker(
        store.clone(),
        embeddings.clone(),
        embedder.clone(),
        cfg.embedding_model.clone(),
    );

    let history = Arc::new(HistoryService::new(
        store.clone(),
        embeddings,
        embedder,
        embed_tx,
        HistoryConfig::from_config(&cfg),
    ));

    let registry = Arc::new(ObjectRegistry::new());
    let cache = Arc::new(ResponseCache::new(
        cfg.cache_capacity,
        std::time::Duration::from_secs(cfg.cache_ttl_seconds),
    ));
    let llm = Arc::new(HttpModelClient::new(cfg.llm_base_url.clone(), cfg.llm_api_key.clone()));

    let broker = Arc::new(Broker::new(store.pool(), cfg.queue_capacity));
    let controller = Arc::new(RunController::new(store.clone(), broker.clone(), cache.clone()));
    let validation = Arc::new(ValidationHarness::new(
        store.clone(),
        llm.clone(),
        // Judging defaults to the same backend; agents pick their own
        // generation models.
        "gpt-4o-mini".to_string(),
    ));

    let worker_deps = Arc::new(WorkerDeps {
        cfg: cfg.clone(),
        store: store.clone(),
        registry,
        cache,
        llm,
        history,
        broker,
    });
    let _workers = spawn_workers(worker_deps);

    let app_state = AppState {
        controller,
        store,
        validation,
        datasets_dir: std::path::PathBuf::from(&cfg.datasets_dir),
        connect_timeout: cfg.connect_timeout(),
    };
    let app = router(app_state);

    let addr = cfg.api_addr();
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
