//! Client seams for the embedding and completion services.
//!
//! The pipeline only talks to these traits. The HTTP-backed services from
//! `recall-embeddings` and `recall-llm` implement them here; tests inject
//! in-memory fakes.

use async_trait::async_trait;
use futures::future::try_join_all;
use recall_embeddings::EmbeddingService;
use recall_llm::{extract_json, ChatMessage, CompletionOptions, LlmService};
use serde_json::Value;

use crate::error::{Error, Result};

/// Longest reply excerpt quoted in a parse error.
const ERROR_EXCERPT_CHARS: usize = 200;

/// Turns text into fixed-length vectors.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Vector length for this deployment.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed many texts, preserving order.
    ///
    /// The default fans out one `embed` per text concurrently and joins them;
    /// the first failure fails the batch.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        try_join_all(texts.iter().map(|text| self.embed(text))).await
    }
}

/// Chat completion with an optional JSON-only reply.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String>;

    /// Complete in JSON mode and recover the JSON value from the reply.
    ///
    /// A reply with no recoverable JSON is an `InvalidInput` error; callers
    /// that tolerate malformed output decide what to do with it.
    async fn complete_json(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Value> {
        let options = CompletionOptions {
            json: true,
            ..*options
        };
        let text = self.complete(messages, &options).await?;

        extract_json(&text).ok_or_else(|| {
            let excerpt: String = text.chars().take(ERROR_EXCERPT_CHARS).collect();
            Error::InvalidInput(format!("Completion was not valid JSON: {}", excerpt))
        })
    }
}

#[async_trait]
impl EmbeddingClient for EmbeddingService {
    fn dimension(&self) -> usize {
        EmbeddingService::dimension(self)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(EmbeddingService::embed(self, text).await?)
    }

    // The provider batch endpoints are cheaper than one call per text.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(EmbeddingService::embed_batch(self, texts).await?)
    }
}

#[async_trait]
impl CompletionClient for LlmService {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String> {
        Ok(LlmService::complete(self, messages, options).await?)
    }
}
