//! Common test utilities: in-memory store, embedder and scripted LLM.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use recall_core::config::Config;
use recall_core::db::{self, DbPool};
use recall_core::services::{
    CompletionClient, EmbeddingClient, MemoryHit, MemoryStore, StoreFilter,
};
use recall_core::{AppState, Error, Result};
use recall_llm::{ChatMessage, CompletionOptions};
use recall_models::MemoryRecord;

pub const DIM: usize = 8;
pub const COLLECTION: &str = "universe";

// ============================================================================
// Embedder
// ============================================================================

/// Hash embeddings, with fixed vectors for chosen texts.
#[derive(Default)]
pub struct FakeEmbedder {
    fixed: Mutex<HashMap<String, Vec<f32>>>,
    pub calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fix(&self, text: &str, vector: Vec<f32>) {
        self.fixed
            .lock()
            .unwrap()
            .insert(text.to_string(), vector);
    }
}

#[async_trait]
impl EmbeddingClient for FakeEmbedder {
    fn dimension(&self) -> usize {
        DIM
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(v) = self.fixed.lock().unwrap().get(text) {
            return Ok(v.clone());
        }
        Ok(recall_embeddings::hash_embed(text, DIM))
    }
}

/// A unit vector along `axis`, tilted towards axis 1 by `tilt`.
pub fn axis_vector(axis: usize, tilt: f32) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[axis] = 1.0;
    v[(axis + 1) % DIM] = tilt;
    v
}

// ============================================================================
// Store
// ============================================================================

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

fn to_hit(record: &MemoryRecord, score: f32) -> MemoryHit {
    MemoryHit {
        id: record.id.clone(),
        owner_id: record.owner_id.clone(),
        content: record.content.clone(),
        title: record.title.clone(),
        source: record.source.clone(),
        importance: record.importance,
        tags: record.tags.clone(),
        created_at: Some(record.created_at),
        score,
    }
}

/// Vec-backed store with cosine search.
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<Vec<MemoryRecord>>,
    /// Reject any upsert of more than one record.
    pub fail_batches: AtomicBool,
    /// Reject single-record upserts whose content contains this text.
    pub poison: Mutex<Option<String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MemoryRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn insert(&self, record: MemoryRecord) {
        self.records.lock().unwrap().push(record);
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn upsert(&self, _collection: &str, records: &[MemoryRecord]) -> Result<()> {
        if records.len() > 1 && self.fail_batches.load(Ordering::SeqCst) {
            return Err(Error::VectorStore("batch rejected".into()));
        }
        if let Some(ref poison) = *self.poison.lock().unwrap() {
            if records.iter().any(|r| r.content.contains(poison.as_str())) {
                return Err(Error::VectorStore("record rejected".into()));
            }
        }

        let mut stored = self.records.lock().unwrap();
        for record in records {
            stored.retain(|r| r.id != record.id);
            stored.push(record.clone());
        }
        Ok(())
    }

    async fn search(
        &self,
        _collection: &str,
        vector: &[f32],
        filter: &StoreFilter,
        limit: usize,
    ) -> Result<Vec<MemoryHit>> {
        let mut hits: Vec<MemoryHit> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| filter.matches(r))
            .map(|r| to_hit(r, cosine(vector, &r.embedding)))
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn fetch(
        &self,
        _collection: &str,
        filter: &StoreFilter,
        limit: usize,
    ) -> Result<Vec<MemoryHit>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| filter.matches(r))
            .take(limit)
            .map(|r| to_hit(r, 0.0))
            .collect())
    }

    async fn delete(&self, _collection: &str, filter: &StoreFilter) -> Result<usize> {
        let mut stored = self.records.lock().unwrap();
        let before = stored.len();
        stored.retain(|r| !filter.matches(r));
        Ok(before - stored.len())
    }
}

// ============================================================================
// LLM
// ============================================================================

/// Replies from a queue; fails once the queue is empty.
#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<String>>>,
    pub prompts: Mutex<Vec<Vec<ChatMessage>>>,
    pub options: Mutex<Vec<CompletionOptions>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let llm = Self::default();
        for reply in replies {
            llm.push(reply);
        }
        llm
    }

    pub fn push(&self, reply: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(Error::Llm(message.to_string())));
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompt(&self, index: usize) -> String {
        self.prompts.lock().unwrap()[index]
            .iter()
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl CompletionClient for ScriptedLlm {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        self.options.lock().unwrap().push(*options);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Llm("script exhausted".into())))
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub db: DbPool,
    pub embedder: Arc<FakeEmbedder>,
    pub store: Arc<InMemoryStore>,
    pub llm: Arc<ScriptedLlm>,
    pub state: AppState,
}

pub async fn harness(llm: ScriptedLlm) -> Harness {
    harness_with_config(llm, Config::default()).await
}

pub async fn harness_with_config(llm: ScriptedLlm, config: Config) -> Harness {
    let db = db::init_memory_ledger()
        .await
        .expect("Failed to create test ledger");
    let embedder = Arc::new(FakeEmbedder::new());
    let store = Arc::new(InMemoryStore::new());
    let llm = Arc::new(llm);

    let state = AppState::from_parts(
        db.clone(),
        embedder.clone(),
        llm.clone(),
        store.clone(),
        &config,
    );

    Harness {
        db,
        embedder,
        store,
        llm,
        state,
    }
}

/// Replies for a full pipeline run.
pub fn stage_replies(key_insights: &[&str]) -> Vec<String> {
    vec![
        r#"{"plan": ["Recall preferences", "Recommend"], "reasoning": "Use what we know"}"#
            .to_string(),
        r#"{"result": "Use Go", "reasoning": "User likes Go", "insights": ["Go is preferred"]}"#
            .to_string(),
        serde_json::json!({"reflection": "Solid", "keyInsights": key_insights}).to_string(),
    ]
}
