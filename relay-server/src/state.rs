//! Composition root: builds every C1-C9 component from [`AppConfig`] and
//! wires them into the shared [`AppState`] axum hands to every handler.

use std::sync::Arc;
use std::time::Duration;

use relay_agent::HttpLlmProxyClient;
use relay_channels::ChannelDispatcher;
use relay_common::config::AppConfig;
use relay_knowledge::{
    create_embedding_provider, HybridKnowledgeIndex, KnowledgeIndex, LazyReranker, QdrantChunkIndex, SqliteChunkStore,
};
use relay_lock::{InMemoryLockService, LockService, RedisLockService};
use relay_orchestrator::{DebounceOrchestrator, DebounceStore, InMemoryDebounceStore, RedisDebounceStore};
use relay_pipeline::{AiResponsePipeline, PipelineSettings};
use relay_router::MessageRouter;
use relay_store::{SqliteStateStore, StateStore};
use relay_tools::{NoopToolExecutor, ToolExecutor};
use relay_ws::WebSocketHub;

pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub lock: Arc<dyn LockService>,
    pub router: MessageRouter,
    pub orchestrator: Arc<DebounceOrchestrator>,
    pub ws_hub: WebSocketHub,
}

impl AppState {
    /// Builds every component from `config`. Redis-backed lock/debounce
    /// state is used whenever `redis.url` is reachable at startup;
    /// otherwise this falls back to in-process equivalents so a single
    /// developer box can run the whole stack without Redis (spec §9
    /// doesn't mandate this, but C1/C7 both ship an in-memory variant for
    /// exactly this reason — see `relay-lock`/`relay-orchestrator`).
    pub async fn build(config: &AppConfig) -> anyhow::Result<Arc<Self>> {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::new(&config.storage.state_db_path)?);

        let lock: Arc<dyn LockService> = match RedisLockService::new(&config.redis.url).await {
            Ok(svc) => Arc::new(svc),
            Err(e) => {
                tracing::warn!(error = %e, "redis lock service unavailable at startup, using in-memory lock");
                Arc::new(InMemoryLockService::new())
            }
        };

        let debounce_store: Arc<dyn DebounceStore> = match RedisDebounceStore::new(&config.redis.url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::warn!(error = %e, "redis debounce store unavailable at startup, using in-memory store");
                Arc::new(InMemoryDebounceStore::new())
            }
        };

        let knowledge = build_knowledge_index(config).await?;

        let llm = Arc::new(HttpLlmProxyClient::new(
            config.pipeline.llm_proxy_url.clone(),
            Duration::from_secs(config.pipeline.llm_timeout_secs),
        ));

        let tools: Arc<dyn ToolExecutor> = Arc::new(NoopToolExecutor);
        let dispatcher = Arc::new(ChannelDispatcher::new());
        let ws_hub = WebSocketHub::new();

        let pipeline_settings = PipelineSettings {
            max_images: config.pipeline.max_images,
            tool_loop_max_turns: config.pipeline.tool_loop_max_turns,
            credit_rate_per_token: config.pipeline.credit_rate_per_token,
            alert_cooldown: Duration::from_secs(config.pipeline.alert_cooldown_secs),
            retrieval_k: config.retrieval.top_k,
        };
        let pipeline = Arc::new(AiResponsePipeline::new(
            store.clone(),
            knowledge,
            llm,
            tools,
            dispatcher,
            Arc::new(ws_hub.clone()),
            pipeline_settings,
        ));

        let orchestrator = Arc::new(
            DebounceOrchestrator::new(debounce_store, pipeline)
                .with_window(Duration::from_secs(config.router.debounce_window_secs)),
        );

        let router = MessageRouter::new(store.clone(), lock.clone());

        Ok(Arc::new(Self { store, lock, router, orchestrator, ws_hub }))
    }
}

async fn build_knowledge_index(config: &AppConfig) -> anyhow::Result<Arc<dyn KnowledgeIndex>> {
    let keyword_store = Arc::new(SqliteChunkStore::new(config.storage.knowledge_db_path.clone())?);

    let embedding = create_embedding_provider(
        config.storage.embedding_base_url.as_deref(),
        config.storage.embedding_api_key.as_deref(),
        config.storage.embedding_model.as_deref(),
        config.storage.embedding_dimensions,
    );

    let vector = match &config.storage.qdrant_url {
        Some(url) => match QdrantChunkIndex::connect(url, embedding) {
            Ok(index) => Some(Arc::new(index)),
            Err(e) => {
                tracing::warn!(error = %e, "qdrant unavailable at startup, retrieval degrades to keyword-only");
                None
            }
        },
        None => None,
    };

    let reranker = match &config.storage.reranker_url {
        Some(url) if config.retrieval.rerank_enabled => LazyReranker::new(Some(url.clone())),
        _ => LazyReranker::disabled(),
    };

    Ok(Arc::new(HybridKnowledgeIndex::new(keyword_store, vector, reranker)))
}
