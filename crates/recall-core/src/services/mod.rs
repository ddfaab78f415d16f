//! Service layer for Recall.
//!
//! Contains the pipeline logic and its collaborators:
//! - Clients (embedding and completion seams)
//! - Store (memory store seam, Qdrant adapter)
//! - Retrieval (weighted similarity/recency/importance ranking)
//! - Agents (stage contracts and prompts)
//! - Extraction (transcript to memory chunks)
//! - Memory (save, forget, replace, retention)
//! - Orchestrator (session lifecycle and resume)

pub mod agents;
pub mod clients;
pub mod extraction;
mod memory;
mod orchestrator;
pub mod retrieval;
pub mod store;

pub use clients::{CompletionClient, EmbeddingClient};
pub use extraction::{ExtractionResult, MemoryExtractor, RecordWriter, StoreOutcome};
pub use memory::{MemoryService, RetentionPolicy};
pub use orchestrator::{
    insight_memory, InsightWriteback, Orchestrator, PipelineResult, SessionTrail, INSIGHT_TAG,
};
pub use retrieval::{RetrievalConfig, RetrievalMode, Retriever, ScoreWeights};
pub use store::{MemoryHit, MemoryStore, QdrantMemoryStore, StoreFilter};
