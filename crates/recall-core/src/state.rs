//! Application state for Recall.
//!
//! Builds every client once and wires them into the services. Nothing here
//! is global; tests assemble the same services from fakes.

use std::sync::Arc;

use recall_embeddings::EmbeddingService;
use recall_llm::LlmService;
use recall_qdrant::QdrantService;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::DbPool;
use crate::services::{
    CompletionClient, EmbeddingClient, MemoryExtractor, MemoryService, MemoryStore, Orchestrator,
    QdrantMemoryStore, RecordWriter, Retriever,
};
use crate::Result;

/// Services shared by every command.
#[derive(Clone)]
pub struct AppState {
    /// Session ledger pool.
    pub db: DbPool,
    pub orchestrator: Orchestrator,
    pub extractor: MemoryExtractor,
    pub memory: MemoryService,
}

impl AppState {
    /// Connect to the ledger, the store and the providers named in `config`.
    pub async fn new(config: &Config) -> Result<Self> {
        let db = crate::db::init_pool(&config.database.path).await?;
        crate::db::initialize_schema(&db).await?;

        let embeddings = EmbeddingService::from_config(&config.embedding)?;
        if !embeddings.has_providers() {
            warn!("No embedding provider configured, using hash embeddings");
        }

        let llm = LlmService::new(&config.llm)?;
        if !llm.is_available() {
            warn!("No LLM provider configured, pipeline and extraction calls will fail");
        }

        let qdrant = QdrantService::new(&recall_qdrant::QdrantConfig::new(
            &config.qdrant.url,
            &config.qdrant.collection_prefix,
        ))
        .await?;

        let store: Arc<dyn MemoryStore> = Arc::new(QdrantMemoryStore::new(qdrant));
        store
            .ensure_collection(&config.memory.profile, embeddings.dimension())
            .await?;

        info!(
            profile = %config.memory.profile,
            embedders = ?embeddings.providers(),
            llms = ?llm.providers(),
            "Services initialized"
        );

        Ok(Self::from_parts(
            db,
            Arc::new(embeddings),
            Arc::new(llm),
            store,
            config,
        ))
    }

    /// Wire services from already-built clients.
    pub fn from_parts(
        db: DbPool,
        embedder: Arc<dyn EmbeddingClient>,
        llm: Arc<dyn CompletionClient>,
        store: Arc<dyn MemoryStore>,
        config: &Config,
    ) -> Self {
        let collection = config.memory.profile.clone();

        let writer = RecordWriter::new(embedder.clone(), store.clone(), collection.clone());
        let retriever = Retriever::new(embedder, store, collection, config.retrieval.clone());

        Self {
            orchestrator: Orchestrator::new(db.clone(), llm.clone(), retriever, writer.clone()),
            extractor: MemoryExtractor::new(llm, writer.clone()),
            memory: MemoryService::new(writer),
            db,
        }
    }
}
