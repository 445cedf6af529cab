//! Application state and component wiring

use askforge_common::{
    cache::Cache,
    config::AppConfig,
    db::DbPool,
    embeddings::create_embedder,
    errors::{AppError, Result},
    Executors,
};
use askforge_context::{
    ChatDependencies, ChatService, GuidanceEngine, GuidanceStore, InMemoryConversationMemory,
    InMemoryGuidanceStore, IntentTree, LlmIntentClassifier, LlmQueryRewriter, PassthroughRewriter,
    QueryRewriter, RedisGuidanceStore, RetrievalOrchestrator,
};
use askforge_llm::{ConfigModelSelector, LlmService, ModelHealthStore, ModelSelector, RoutingLlmService, StreamTaskManager};
use askforge_search::{
    create_reranker, LlmParameterExtractor, McpService, McpToolRegistry, RetrievedChunk, Retriever, VectorRetriever,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub chat: Arc<ChatService>,
    pub db: Option<Arc<DbPool>>,
    pub cache: Option<Arc<Cache>>,
}

/// Stands in for the vector store when no database is configured; KB
/// intents then fail and are dropped from the context.
struct NoVectorStore;

#[async_trait]
impl Retriever for NoVectorStore {
    async fn retrieve(&self, collection: &str, _query: &str, _top_k: usize) -> Result<Vec<RetrievedChunk>> {
        Err(AppError::Retrieval {
            collection: collection.to_string(),
            message: "no vector store configured".to_string(),
        })
    }
}

impl AppState {
    /// Connect backing services and assemble the answering pipeline
    pub async fn build(config: AppConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let executors = Executors::from_config(&config.executors);

        let tree = Arc::new(IntentTree::load(&config.rag.intent.tree_path)?);

        let health = Arc::new(ModelHealthStore::from_config(&config.ai.health));
        let selector: Arc<dyn ModelSelector> = Arc::new(ConfigModelSelector::new(&config.ai, health.clone())?);
        let llm: Arc<dyn LlmService> = Arc::new(RoutingLlmService::from_config(
            &config.ai,
            selector,
            health,
            executors.stream.clone(),
        )?);

        let db = match &config.database {
            Some(database) => {
                info!("Connecting to vector store...");
                Some(Arc::new(DbPool::new(database).await?))
            }
            None => None,
        };
        let retriever: Arc<dyn Retriever> = match &db {
            Some(db) => Arc::new(VectorRetriever::new(db.clone(), create_embedder(&config.embedding)?)),
            None => {
                warn!("No database configured, knowledge-base retrieval is disabled");
                Arc::new(NoVectorStore)
            }
        };

        let cache = match &config.redis {
            Some(redis) => Some(Arc::new(Cache::new(redis).await?)),
            None => None,
        };
        let guidance_ttl = config.rag.guidance.state_ttl_secs;
        let guidance_store: Arc<dyn GuidanceStore> = match &cache {
            Some(cache) => Arc::new(RedisGuidanceStore::new(cache.clone(), guidance_ttl)),
            None => Arc::new(InMemoryGuidanceStore::new(Duration::from_secs(guidance_ttl))),
        };

        let registry = Arc::new(McpToolRegistry::from_config(&config.rag.mcp)?);
        let mcp = Arc::new(McpService::new(
            registry,
            Duration::from_secs(config.rag.mcp.call_timeout_secs),
        ));

        let rewriter: Arc<dyn QueryRewriter> = if config.rag.rewrite.enabled {
            Arc::new(LlmQueryRewriter::new(llm.clone(), config.rag.rewrite.clone()))
        } else {
            Arc::new(PassthroughRewriter)
        };

        let retrieval = RetrievalOrchestrator::new(
            retriever,
            create_reranker(&config.ai.rerank)?,
            mcp,
            Arc::new(LlmParameterExtractor::new(llm.clone())),
            executors.clone(),
            config.rag.intent.clone(),
            config.rag.retrieval.clone(),
        );

        let chat = ChatService::new(ChatDependencies {
            tree: tree.clone(),
            memory: Arc::new(InMemoryConversationMemory::new(config.rag.memory.max_messages)),
            rewriter,
            classifier: Arc::new(LlmIntentClassifier::new(tree.clone(), llm.clone())),
            guidance: Arc::new(GuidanceEngine::new(
                tree,
                llm.clone(),
                guidance_store,
                config.rag.guidance.clone(),
            )),
            retrieval,
            llm,
            tasks: Arc::new(StreamTaskManager::new()),
            executors,
        });

        Ok(Self {
            config,
            chat: Arc::new(chat),
            db,
            cache,
        })
    }
}
