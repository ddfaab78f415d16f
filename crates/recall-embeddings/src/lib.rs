//! Fixed-dimension embedding client with multi-provider fallback.
//!
//! Supports Gemini, OpenAI and Ollama embedding APIs. Providers are tried in
//! priority order with retries on rate limits and transient failures. When
//! no provider is configured, deterministic hash-based vectors are produced
//! so development setups work offline.
//!
//! Every vector returned by [`EmbeddingService`] has exactly the configured
//! dimension. Empty input yields a zero vector; a provider answering with a
//! vector of another length is an error.
//!
//! # Example
//!
//! ```no_run
//! use recall_embeddings::{EmbeddingConfig, EmbeddingProviderConfig, EmbeddingService};
//!
//! # async fn example() -> Result<(), recall_embeddings::Error> {
//! let config = EmbeddingConfig {
//!     providers: vec![EmbeddingProviderConfig::new("gemini", "your-api-key", 1)],
//!     dimension: 768,
//! };
//!
//! let service = EmbeddingService::from_config(&config)?;
//! let vector = service.embed("hello world").await?;
//! assert_eq!(vector.len(), 768);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Maximum attempts per provider before falling back to the next one
const MAX_RETRIES: u32 = 2;

/// Delay between retries (doubles each time)
const RETRY_DELAY_MS: u64 = 500;

/// Maximum texts per provider batch call
const MAX_BATCH_SIZE: usize = 100;

// ============================================================================
// Error types
// ============================================================================

/// Errors that can occur in the embedding service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Internal error (HTTP client setup, response decoding, ...)
    #[error("Internal error: {0}")]
    Internal(String),

    /// The request never got an HTTP response
    #[error("{provider} request failed: {message}")]
    Transport { provider: String, message: String },

    /// Provider answered with an error
    #[error("{provider} error ({status}): {message}")]
    Provider {
        provider: String,
        status: u16,
        message: String,
    },

    /// Provider requires credentials that are not configured
    #[error("No credentials configured for {0}")]
    NoCredentials(String),

    /// Provider returned a vector of the wrong length
    #[error("Embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// All providers failed
    #[error("All embedding providers failed")]
    AllProvidersFailed,
}

impl Error {
    /// Rate limits, server errors and transport failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::Provider { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Configuration types
// ============================================================================

/// Configuration for the embedding service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding providers; tried in ascending `priority`.
    pub providers: Vec<EmbeddingProviderConfig>,
    /// Dimension of every vector the service returns.
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            dimension: 768,
        }
    }
}

/// Configuration for a single embedding provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingProviderConfig {
    /// Provider name ("gemini", "openai" or "ollama").
    pub name: String,
    /// Base URL for the API.
    pub base_url: String,
    /// Model name to use.
    pub model: String,
    /// API key. Ollama needs none.
    pub api_key: String,
    /// Priority (lower = tried first).
    pub priority: u8,
}

impl EmbeddingProviderConfig {
    /// Provider with the default endpoint and model for `name`.
    pub fn new(name: &str, api_key: impl Into<String>, priority: u8) -> Self {
        Self {
            name: name.to_string(),
            base_url: default_endpoint(name),
            model: default_model(name),
            api_key: api_key.into(),
            priority,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn has_credentials(&self) -> bool {
        self.name == "ollama" || !self.api_key.is_empty()
    }
}

/// Get default endpoint for a provider.
pub fn default_endpoint(name: &str) -> String {
    match name {
        "gemini" => "https://generativelanguage.googleapis.com/v1beta".to_string(),
        "ollama" => "http://localhost:11434".to_string(),
        _ => "https://api.openai.com/v1".to_string(),
    }
}

/// Get default model for a provider.
pub fn default_model(name: &str) -> String {
    match name {
        "gemini" => "text-embedding-004".to_string(),
        "ollama" => "nomic-embed-text".to_string(),
        _ => "text-embedding-3-small".to_string(),
    }
}

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct GeminiEmbedResponse {
    embedding: Option<GeminiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct GeminiBatchResponse {
    embeddings: Option<Vec<GeminiEmbedding>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbedResponse {
    data: Option<Vec<OpenAIEmbedding>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbedding {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Option<Vec<Vec<f32>>>,
    embedding: Option<Vec<f32>>,
}

// ============================================================================
// Embedding service
// ============================================================================

/// Service for generating fixed-dimension text embeddings.
#[derive(Clone)]
pub struct EmbeddingService {
    inner: Arc<EmbeddingServiceInner>,
}

struct EmbeddingServiceInner {
    providers: Vec<EmbeddingProviderConfig>,
    dimension: usize,
    client: Client,
}

impl EmbeddingService {
    /// Create a new embedding service from configuration.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        if config.dimension == 0 {
            return Err(Error::Internal("Embedding dimension must be positive".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let mut providers = config.providers.clone();
        providers.sort_by_key(|p| p.priority);

        if providers.is_empty() {
            warn!(
                dimension = config.dimension,
                "No embedding providers configured - using hash-based placeholders"
            );
        } else {
            info!(
                providers = ?providers.iter().map(|p| &p.name).collect::<Vec<_>>(),
                dimension = config.dimension,
                "Embedding service initialized"
            );
        }

        Ok(Self {
            inner: Arc::new(EmbeddingServiceInner {
                providers,
                dimension: config.dimension,
                client,
            }),
        })
    }

    /// Dimension of every returned vector.
    pub fn dimension(&self) -> usize {
        self.inner.dimension
    }

    /// Provider names in priority order.
    pub fn providers(&self) -> Vec<String> {
        self.inner.providers.iter().map(|p| p.name.clone()).collect()
    }

    /// Check if real embedding providers are available.
    pub fn has_providers(&self) -> bool {
        !self.inner.providers.is_empty()
    }

    /// Embed a single text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::Internal("Provider returned no embedding".to_string()))
    }

    /// Embed many texts, preserving order.
    ///
    /// Blank texts get zero vectors without a provider call. The rest are
    /// sent in provider batches of at most 100.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let dim = self.inner.dimension;
        let mut out: Vec<Vec<f32>> = vec![Vec::new(); texts.len()];

        let pending: Vec<usize> = texts
            .iter()
            .enumerate()
            .filter_map(|(i, t)| {
                if t.trim().is_empty() {
                    None
                } else {
                    Some(i)
                }
            })
            .collect();

        for (i, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                out[i] = vec![0.0; dim];
            }
        }

        if pending.is_empty() {
            return Ok(out);
        }

        if self.inner.providers.is_empty() {
            debug!(count = pending.len(), "Generating hash-based placeholder embeddings");
            for i in pending {
                out[i] = hash_embed(&texts[i], dim);
            }
            return Ok(out);
        }

        debug!(count = pending.len(), "Generating API embeddings");

        for batch in pending.chunks(MAX_BATCH_SIZE) {
            let batch_texts: Vec<String> = batch.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.embed_with_fallback(&batch_texts).await?;

            if vectors.len() != batch_texts.len() {
                return Err(Error::Internal(format!(
                    "Provider returned {} embeddings for {} texts",
                    vectors.len(),
                    batch_texts.len()
                )));
            }

            for (&i, vector) in batch.iter().zip(vectors) {
                if vector.len() != dim {
                    return Err(Error::DimensionMismatch {
                        expected: dim,
                        actual: vector.len(),
                    });
                }
                out[i] = vector;
            }
        }

        Ok(out)
    }

    /// Try each provider in order until one succeeds.
    async fn embed_with_fallback(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_error = None;

        for provider in &self.inner.providers {
            if !provider.has_credentials() {
                debug!(provider = %provider.name, "Skipping provider without credentials");
                continue;
            }

            match self.try_provider(provider, texts).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(e) => {
                    warn!(
                        provider = %provider.name,
                        error = %e,
                        "Embedding provider failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        // Configured providers that all fail are an error; never hash here.
        Err(last_error.unwrap_or(Error::AllProvidersFailed))
    }

    /// Try a provider with retries.
    async fn try_provider(
        &self,
        provider: &EmbeddingProviderConfig,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let mut delay = Duration::from_millis(RETRY_DELAY_MS);
        let mut attempt = 0;

        loop {
            match self.call_provider(provider, texts).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(e) if e.is_retryable() && attempt + 1 < MAX_RETRIES => {
                    debug!(
                        provider = %provider.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after error"
                    );
                    sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_provider(
        &self,
        provider: &EmbeddingProviderConfig,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        match provider.name.as_str() {
            "gemini" => self.call_gemini(provider, texts).await,
            "openai" => self.call_openai(provider, texts).await,
            "ollama" => self.call_ollama(provider, texts).await,
            _ => Err(Error::Internal(format!(
                "Unknown embedding provider: {}",
                provider.name
            ))),
        }
    }

    /// Send a request and decode the JSON body, mapping HTTP failures.
    async fn send<T: DeserializeOwned>(&self, provider: &str, request: RequestBuilder) -> Result<T> {
        let response = request.send().await.map_err(|e| Error::Transport {
            provider: provider.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider: provider.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("Failed to parse {} response: {}", provider, e)))
    }

    async fn call_gemini(
        &self,
        provider: &EmbeddingProviderConfig,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        if provider.api_key.is_empty() {
            return Err(Error::NoCredentials(provider.name.clone()));
        }

        if let [text] = texts {
            let url = format!(
                "{}/models/{}:embedContent?key={}",
                provider.base_url, provider.model, provider.api_key
            );
            let body = json!({
                "model": format!("models/{}", provider.model),
                "content": { "parts": [{"text": text}] },
                "outputDimensionality": self.inner.dimension
            });

            let resp: GeminiEmbedResponse =
                self.send("gemini", self.inner.client.post(&url).json(&body)).await?;
            return resp
                .embedding
                .map(|e| vec![e.values])
                .ok_or_else(|| Error::Internal("No embedding in Gemini response".to_string()));
        }

        let url = format!(
            "{}/models/{}:batchEmbedContents?key={}",
            provider.base_url, provider.model, provider.api_key
        );
        let requests: Vec<_> = texts
            .iter()
            .map(|text| {
                json!({
                    "model": format!("models/{}", provider.model),
                    "content": { "parts": [{"text": text}] },
                    "outputDimensionality": self.inner.dimension
                })
            })
            .collect();

        let resp: GeminiBatchResponse = self
            .send("gemini", self.inner.client.post(&url).json(&json!({ "requests": requests })))
            .await?;

        resp.embeddings
            .map(|embs| embs.into_iter().map(|e| e.values).collect())
            .ok_or_else(|| Error::Internal("No embeddings in Gemini batch response".to_string()))
    }

    async fn call_openai(
        &self,
        provider: &EmbeddingProviderConfig,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        if provider.api_key.is_empty() {
            return Err(Error::NoCredentials(provider.name.clone()));
        }

        let url = format!("{}/embeddings", provider.base_url);
        let body = json!({
            "model": provider.model,
            "input": texts,
            "dimensions": self.inner.dimension
        });

        let request = self
            .inner
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", provider.api_key))
            .json(&body);
        let resp: OpenAIEmbedResponse = self.send("openai", request).await?;

        let mut data = resp
            .data
            .ok_or_else(|| Error::Internal("No embeddings in OpenAI response".to_string()))?;

        // Sort by index to ensure correct order
        data.sort_by_key(|e| e.index);

        Ok(data.into_iter().map(|e| e.embedding).collect())
    }

    async fn call_ollama(
        &self,
        provider: &EmbeddingProviderConfig,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", provider.base_url);
        let body = json!({
            "model": provider.model,
            "input": texts
        });

        let resp: OllamaEmbedResponse =
            self.send("ollama", self.inner.client.post(&url).json(&body)).await?;

        if let Some(embeddings) = resp.embeddings {
            return Ok(embeddings);
        }
        // Older servers answer single-prompt requests with `embedding`
        if let Some(embedding) = resp.embedding {
            return Ok(vec![embedding]);
        }

        Err(Error::Internal("No embeddings in Ollama response".to_string()))
    }
}

/// Generate a deterministic unit vector from text using hashing.
/// This is NOT semantic - just a fallback for development and tests.
pub fn hash_embed(text: &str, dim: usize) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut embedding: Vec<f32> = (0..dim)
        .map(|i| {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            (i as u64).hash(&mut hasher);
            let hash = hasher.finish();
            // Map to [-1, 1]
            ((hash as f64 / u64::MAX as f64) * 2.0 - 1.0) as f32
        })
        .collect();

    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut embedding {
            *x /= norm;
        }
    }

    embedding
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn placeholder_service(dimension: usize) -> EmbeddingService {
        EmbeddingService::from_config(&EmbeddingConfig {
            providers: vec![],
            dimension,
        })
        .unwrap()
    }

    fn openai_service(server: &MockServer, dimension: usize) -> EmbeddingService {
        EmbeddingService::from_config(&EmbeddingConfig {
            providers: vec![EmbeddingProviderConfig::new("openai", "sk-test", 1)
                .with_base_url(server.uri())],
            dimension,
        })
        .unwrap()
    }

    #[test]
    fn test_hash_embed_deterministic() {
        let emb1 = hash_embed("test text", 384);
        let emb2 = hash_embed("test text", 384);

        assert_eq!(emb1, emb2);
        assert_eq!(emb1.len(), 384);
    }

    #[test]
    fn test_hash_embed_normalized() {
        let emb = hash_embed("test text", 384);
        let norm: f32 = emb.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.001);
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("\n\t")]
    #[tokio::test]
    async fn test_blank_input_is_zero_vector(#[case] text: &str) {
        let service = placeholder_service(8);
        let v = service.embed(text).await.unwrap();
        assert_eq!(v, vec![0.0; 8]);
    }

    #[tokio::test]
    async fn test_empty_batch_returns_empty() {
        let service = placeholder_service(8);
        assert!(service.embed_batch(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_placeholder_mode_uses_configured_dimension() {
        let service = placeholder_service(16);
        assert!(!service.has_providers());

        let texts = vec!["hello".to_string(), "".to_string(), "world".to_string()];
        let result = service.embed_batch(&texts).await.unwrap();

        assert_eq!(result.len(), 3);
        assert!(result.iter().all(|v| v.len() == 16));
        assert_eq!(result[1], vec![0.0; 16]);
        assert_eq!(result[0], hash_embed("hello", 16));
    }

    #[tokio::test]
    async fn test_openai_batch_is_reordered_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [1.0, 0.0]}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let service = openai_service(&server, 2);
        let texts = vec!["first".to_string(), "second".to_string()];
        let result = service.embed_batch(&texts).await.unwrap();

        assert_eq!(result, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"index": 0, "embedding": [1.0, 0.0, 0.0]}]
            })))
            .mount(&server)
            .await;

        let service = openai_service(&server, 2);
        let err = service.embed("text").await.unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_falls_back_to_next_provider() {
        let failing = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&failing)
            .await;

        let working = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embeddings": [[0.5, 0.5]]
            })))
            .mount(&working)
            .await;

        let service = EmbeddingService::from_config(&EmbeddingConfig {
            providers: vec![
                EmbeddingProviderConfig::new("ollama", "", 2).with_base_url(working.uri()),
                EmbeddingProviderConfig::new("openai", "sk-test", 1).with_base_url(failing.uri()),
            ],
            dimension: 2,
        })
        .unwrap();

        assert_eq!(service.providers(), vec!["openai", "ollama"]);
        assert_eq!(service.embed("text").await.unwrap(), vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn test_all_providers_failing_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("nope"))
            .mount(&server)
            .await;

        let service = openai_service(&server, 2);
        let err = service.embed("text").await.unwrap_err();
        assert!(matches!(err, Error::Provider { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_gemini_single_uses_embed_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/text-embedding-004:embedContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embedding": {"values": [0.1, 0.2, 0.3]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let service = EmbeddingService::from_config(&EmbeddingConfig {
            providers: vec![EmbeddingProviderConfig::new("gemini", "key", 1)
                .with_base_url(server.uri())],
            dimension: 3,
        })
        .unwrap();

        assert_eq!(service.embed("hi").await.unwrap(), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_retryable_errors() {
        let rate_limited = Error::Provider {
            provider: "openai".into(),
            status: 429,
            message: String::new(),
        };
        let bad_request = Error::Provider {
            provider: "openai".into(),
            status: 400,
            message: String::new(),
        };
        assert!(rate_limited.is_retryable());
        assert!(!bad_request.is_retryable());
        assert!(!Error::AllProvidersFailed.is_retryable());
    }

    #[test]
    fn test_default_endpoints_and_models() {
        assert_eq!(
            default_endpoint("gemini"),
            "https://generativelanguage.googleapis.com/v1beta"
        );
        assert_eq!(default_endpoint("ollama"), "http://localhost:11434");
        assert_eq!(default_model("openai"), "text-embedding-3-small");
    }
}
