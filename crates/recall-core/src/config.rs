//! Configuration management for Recall.
//!
//! Loads configuration from environment variables (and a `.env` file via
//! dotenvy) with support for:
//! - Multiple LLM and embedding providers with fallback priority
//! - Database and vector store connections
//! - Retrieval tuning (mode, limit, recency half-life, score weights)

use std::env;
use std::str::FromStr;
use std::sync::OnceLock;

use recall_embeddings::{EmbeddingConfig, EmbeddingProviderConfig};
use recall_llm::{LlmConfig, LlmProviderConfig};
use tracing::warn;

use crate::services::retrieval::{RetrievalConfig, ScoreWeights};

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub qdrant: QdrantConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub collection_prefix: String,
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Agent profile; selects the `{prefix}{profile}` collection.
    pub profile: String,
}

impl Default for Config {
    /// Local defaults with no providers (hash embeddings, no LLM).
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                path: "./data/recall.db".to_string(),
            },
            qdrant: QdrantConfig {
                url: "http://localhost:6334".to_string(),
                collection_prefix: "recall_".to_string(),
            },
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            retrieval: RetrievalConfig::default(),
            memory: MemoryConfig {
                profile: "universe".to_string(),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = RetrievalConfig::default();

        Self {
            database: DatabaseConfig {
                path: env_or("DATABASE_PATH", "./data/recall.db"),
            },
            qdrant: QdrantConfig {
                url: env_or("QDRANT_URL", "http://localhost:6334"),
                collection_prefix: env_or("QDRANT_COLLECTION_PREFIX", "recall_"),
            },
            embedding: Self::parse_embedding_config(),
            llm: LlmConfig {
                providers: Self::parse_llm_providers(),
            },
            retrieval: RetrievalConfig {
                mode: env_parse("RETRIEVAL_MODE", defaults.mode),
                limit: env_parse("RETRIEVAL_LIMIT", defaults.limit),
                candidate_multiplier: env_parse(
                    "RETRIEVAL_CANDIDATE_MULTIPLIER",
                    defaults.candidate_multiplier,
                )
                .max(1),
                half_life_days: env_parse("RECENCY_HALF_LIFE_DAYS", defaults.half_life_days),
                weights: Self::parse_weights(defaults.weights),
            },
            memory: MemoryConfig {
                profile: env_or("MEMORY_PROFILE", "universe"),
            },
        }
    }

    /// Parse LLM providers from environment, sorted by priority.
    fn parse_llm_providers() -> Vec<LlmProviderConfig> {
        let mut providers = Vec::new();

        if let Ok(api_key) = env::var("GOOGLE_API_KEY") {
            providers.push(
                LlmProviderConfig::new("gemini", api_key, 1)
                    .with_model(env_or("GEMINI_MODEL", "gemini-1.5-flash")),
            );
        }

        if let Ok(api_key) = env::var("ANTHROPIC_API_KEY") {
            providers.push(
                LlmProviderConfig::new("anthropic", api_key, 2)
                    .with_model(env_or("ANTHROPIC_MODEL", "claude-3-5-haiku-20241022")),
            );
        }

        if let Ok(api_key) = env::var("OPENROUTER_API_KEY") {
            providers.push(
                LlmProviderConfig::new("openrouter", api_key, 3).with_model(env_or(
                    "OPENROUTER_MODEL",
                    "meta-llama/llama-3-8b-instruct:free",
                )),
            );
        }

        if let Ok(api_key) = env::var("OPENAI_API_KEY") {
            providers.push(
                LlmProviderConfig::new("openai", api_key, 4)
                    .with_model(env_or("OPENAI_MODEL", "gpt-4o-mini")),
            );
        }

        providers.sort_by_key(|p| p.priority);
        providers
    }

    /// Parse embedding providers from environment.
    /// Ollama, when configured, is preferred as the local provider.
    fn parse_embedding_config() -> EmbeddingConfig {
        let mut providers = Vec::new();

        if let Ok(api_key) = env::var("GOOGLE_API_KEY") {
            providers.push(
                EmbeddingProviderConfig::new("gemini", api_key, 1)
                    .with_model(env_or("GEMINI_EMBEDDING_MODEL", "text-embedding-004")),
            );
        }

        if let Ok(api_key) = env::var("OPENAI_API_KEY") {
            providers.push(
                EmbeddingProviderConfig::new("openai", api_key, 2)
                    .with_model(env_or("OPENAI_EMBEDDING_MODEL", "text-embedding-3-small")),
            );
        }

        if let Ok(ollama_url) = env::var("OLLAMA_URL") {
            providers.push(
                EmbeddingProviderConfig::new("ollama", "", env_parse("OLLAMA_PRIORITY", 0))
                    .with_base_url(ollama_url)
                    .with_model(env_or("OLLAMA_EMBEDDING_MODEL", "nomic-embed-text")),
            );
        }

        providers.sort_by_key(|p| p.priority);

        EmbeddingConfig {
            providers,
            dimension: env_parse("EMBEDDING_DIMENSION", 768usize).max(1),
        }
    }

    fn parse_weights(defaults: ScoreWeights) -> ScoreWeights {
        let similarity = env_parse("WEIGHT_SIMILARITY", defaults.similarity);
        let recency = env_parse("WEIGHT_RECENCY", defaults.recency);
        let importance = env_parse("WEIGHT_IMPORTANCE", defaults.importance);

        match ScoreWeights::new(similarity, recency, importance) {
            Ok(weights) => weights,
            Err(e) => {
                warn!(error = %e, "Invalid retrieval weights, using defaults");
                defaults
            }
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an env var, falling back to `default` when unset or malformed.
fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "Ignoring malformed configuration value");
                default
            }
        },
        Err(_) => default,
    }
}
