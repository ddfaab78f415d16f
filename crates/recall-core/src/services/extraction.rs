//! Conversation memory extraction.
//!
//! Asks the model for self-contained knowledge chunks in a transcript,
//! validates them, then embeds and stores the survivors. Extraction never
//! fails as a call: every problem is reported in [`ExtractionResult`].

use std::collections::HashSet;
use std::sync::Arc;

use recall_llm::{ChatMessage, CompletionOptions, Role};
use recall_models::{new_id, MemoryChunk, MemoryRecord, MemorySource, NewMemory};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::clients::{CompletionClient, EmbeddingClient};
use super::store::MemoryStore;
use crate::error::{Error, Result};

const EXTRACTION_SYSTEM_PROMPT: &str = r#"You are a memory extraction system. Analyze the following conversation and extract key knowledge, facts, and insights.

Your task is to return a JSON object with a "chunks" property containing an array of memory chunks. Each memory chunk must conform to this exact schema:
{
  "id": "uuid-string",
  "title": "Brief descriptive summary (max 100 characters)",
  "content": "Detailed knowledge/fact extracted from the conversation",
  "tags": ["keyword1", "keyword2", ...]
}

Return format:
{
  "chunks": [
    { "id": "...", "title": "...", "content": "...", "tags": [...] },
    ...
  ]
}

Guidelines:
- Extract only significant, reusable knowledge (facts, insights, decisions, preferences)
- Each chunk should be self-contained and meaningful
- Use clear, concise titles
- Include relevant tags for classification and retrieval
- Avoid extracting trivial or conversational elements
- Focus on information that would be useful for future reference

Return ONLY a valid JSON object with the "chunks" array, no additional text or explanation."#;

/// Wrapper keys tried, in order, before any other array-valued key.
const WRAPPER_KEYS: [&str; 3] = ["chunks", "memories", "data"];

/// Outcome of one extraction run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub success: bool,
    pub chunks_stored: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ExtractionResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            chunks_stored: 0,
            errors: vec![error.into()],
        }
    }
}

/// Outcome of a [`RecordWriter::store_records`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreOutcome {
    /// Ids of the records that reached the store.
    pub stored: Vec<String>,
    pub errors: Vec<String>,
}

/// Embeds record inputs and upserts them into one collection.
#[derive(Clone)]
pub struct RecordWriter {
    embedder: Arc<dyn EmbeddingClient>,
    store: Arc<dyn MemoryStore>,
    collection: String,
}

impl RecordWriter {
    pub fn new(
        embedder: Arc<dyn EmbeddingClient>,
        store: Arc<dyn MemoryStore>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            embedder,
            store,
            collection: collection.into(),
        }
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingClient> {
        &self.embedder
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Embed all inputs in one batch call, then upsert them in one request.
    ///
    /// When the batch upsert fails each record is retried alone and every
    /// individual failure is reported. An embedding failure fails the call.
    pub async fn store_records(&self, inputs: Vec<NewMemory>) -> Result<StoreOutcome> {
        let mut outcome = StoreOutcome::default();
        if inputs.is_empty() {
            return Ok(outcome);
        }

        let texts: Vec<String> = inputs.iter().map(|m| m.content.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != inputs.len() {
            return Err(Error::Embedding(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                vectors.len()
            )));
        }

        let dimension = self.embedder.dimension();
        let mut records = Vec::with_capacity(inputs.len());
        for (input, vector) in inputs.into_iter().zip(vectors) {
            let label = input.id.clone().unwrap_or_default();
            match MemoryRecord::new(input, vector, dimension) {
                Ok(record) => records.push(record),
                Err(e) => outcome
                    .errors
                    .push(format!("Failed to store chunk {}: {}", label, e)),
            }
        }

        match self.store.upsert(&self.collection, &records).await {
            Ok(()) => {
                outcome.stored = records.iter().map(|r| r.id.clone()).collect();
                debug!(count = records.len(), "Stored memory records in batch");
            }
            Err(e) => {
                warn!(error = %e, count = records.len(), "Batch upsert failed, storing records individually");
                for record in &records {
                    match self
                        .store
                        .upsert(&self.collection, std::slice::from_ref(record))
                        .await
                    {
                        Ok(()) => outcome.stored.push(record.id.clone()),
                        Err(e) => outcome
                            .errors
                            .push(format!("Failed to store chunk {}: {}", record.id, e)),
                    }
                }
            }
        }

        for record in records.iter().filter(|r| outcome.stored.contains(&r.id)) {
            metrics::counter!(
                "recall_memories_stored_total",
                "source" => record.source.as_str().to_string()
            )
            .increment(1);
        }

        Ok(outcome)
    }
}

/// Turns chat transcripts into stored memories.
#[derive(Clone)]
pub struct MemoryExtractor {
    llm: Arc<dyn CompletionClient>,
    writer: RecordWriter,
}

impl MemoryExtractor {
    pub fn new(llm: Arc<dyn CompletionClient>, writer: RecordWriter) -> Self {
        Self { llm, writer }
    }

    pub async fn extract_and_store(
        &self,
        transcript: &[ChatMessage],
        user_id: &str,
    ) -> ExtractionResult {
        if transcript.is_empty() {
            return ExtractionResult::failed("History is empty");
        }
        if user_id.trim().is_empty() {
            return ExtractionResult::failed("User id is empty");
        }

        let reply = match self
            .llm
            .complete_json(&extraction_messages(transcript), &extraction_options())
            .await
        {
            Ok(value) => value,
            Err(Error::InvalidInput(e)) => {
                return ExtractionResult::failed(format!(
                    "Failed to parse LLM response as JSON: {}",
                    e
                ))
            }
            Err(e) => {
                return ExtractionResult::failed(format!(
                    "Memory extraction pipeline failed: {}",
                    e
                ))
            }
        };

        let candidates = match unwrap_chunks(reply) {
            Ok(candidates) => candidates,
            Err(e) => {
                return ExtractionResult::failed(format!(
                    "Failed to parse LLM response as JSON: {}",
                    e
                ))
            }
        };

        let mut errors = Vec::new();
        let mut chunks: Vec<MemoryChunk> = Vec::new();
        let mut seen = HashSet::new();
        for (i, candidate) in candidates.iter().enumerate() {
            match validate_chunk(candidate) {
                Ok(mut chunk) => {
                    // A repeated id would overwrite the earlier chunk
                    if !seen.insert(chunk.id.clone()) {
                        debug!(index = i, id = %chunk.id, "Duplicate chunk id, assigning a new one");
                        chunk.id = new_id();
                        seen.insert(chunk.id.clone());
                    }
                    chunks.push(chunk);
                }
                Err(e) => {
                    warn!(index = i, error = %e, "Dropping invalid memory chunk");
                    errors.push(format!("Chunk {} validation failed: {}", i, e));
                }
            }
        }

        if chunks.is_empty() {
            errors.push("No valid memory chunks extracted after validation".to_string());
            return ExtractionResult {
                success: false,
                chunks_stored: 0,
                errors,
            };
        }

        let inputs = chunks
            .into_iter()
            .map(|chunk| chunk.into_new_memory(user_id, MemorySource::Conversation))
            .collect();

        match self.writer.store_records(inputs).await {
            Ok(outcome) => {
                errors.extend(outcome.errors);
                let stored = outcome.stored.len();
                info!(user_id, stored, failed = errors.len(), "Memory extraction finished");
                ExtractionResult {
                    success: stored > 0,
                    chunks_stored: stored,
                    errors,
                }
            }
            Err(e) => {
                errors.push(format!("Memory extraction pipeline failed: {}", e));
                ExtractionResult {
                    success: false,
                    chunks_stored: 0,
                    errors,
                }
            }
        }
    }
}

pub fn extraction_options() -> CompletionOptions {
    CompletionOptions {
        temperature: 0.3,
        max_tokens: 2048,
        json: true,
    }
}

pub fn extraction_messages(transcript: &[ChatMessage]) -> Vec<ChatMessage> {
    let conversation = transcript
        .iter()
        .map(|msg| {
            let speaker = match msg.role {
                Role::User => "User",
                _ => "Assistant",
            };
            format!("{}: {}", speaker, msg.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    vec![
        ChatMessage::system(EXTRACTION_SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Analyze this conversation and extract memory chunks:\n\n{}",
            conversation
        )),
    ]
}

/// Find the chunk array in a reply.
fn unwrap_chunks(reply: Value) -> std::result::Result<Vec<Value>, String> {
    match reply {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            for key in WRAPPER_KEYS {
                if matches!(map.get(key), Some(Value::Array(_))) {
                    if let Some(Value::Array(items)) = map.remove(key) {
                        return Ok(items);
                    }
                }
            }
            map.into_iter()
                .find_map(|(_, v)| match v {
                    Value::Array(items) => Some(items),
                    _ => None,
                })
                .ok_or_else(|| "LLM response is not an array or array wrapper".to_string())
        }
        _ => Err("LLM response is not an array or array wrapper".to_string()),
    }
}

fn validate_chunk(candidate: &Value) -> std::result::Result<MemoryChunk, String> {
    let object = candidate
        .as_object()
        .ok_or_else(|| "chunk is not an object".to_string())?;

    let id = object
        .get("id")
        .and_then(Value::as_str)
        .and_then(|id| uuid::Uuid::parse_str(id).ok())
        .map(|uuid| uuid.to_string())
        .unwrap_or_else(new_id);

    let title = object
        .get("title")
        .and_then(Value::as_str)
        .ok_or_else(|| "title must be a string".to_string())?;
    let content = object
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| "content must be a string".to_string())?;
    let tags = object
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(|t| t.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    MemoryChunk::new(id, title, content, tags).map_err(|e| e.to_string())
}
