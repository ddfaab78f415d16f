//! Chat-completion client with multi-provider fallback.
//!
//! Supports Gemini, Anthropic, OpenRouter and OpenAI. Providers are tried in
//! priority order with retries on rate limits and server errors. A JSON mode
//! flag maps onto each provider's structured-output switch, and
//! [`extract_json`] recovers a JSON value from fenced or chatty replies.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Maximum attempts per provider before fallback
const MAX_RETRIES: u32 = 2;

/// Delay between retries (doubles each time)
const RETRY_DELAY_MS: u64 = 500;

const JSON_INSTRUCTION: &str = "Respond with a single valid JSON value and nothing else.";

/// Error types for the completion client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Provider returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("No providers configured")]
    NoProviders,

    #[error("Request failed: {0}")]
    Request(String),
}

impl Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::RateLimitExceeded | Error::Request(_) => true,
            Error::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result type for completion operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling options for one completion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the provider for a JSON-only reply.
    pub json: bool,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
            json: false,
        }
    }
}

impl CompletionOptions {
    pub fn json(temperature: f32) -> Self {
        Self {
            temperature,
            json: true,
            ..Self::default()
        }
    }
}

/// Configuration for an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub priority: u8,
}

impl LlmProviderConfig {
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
}

/// Configuration for the LLM service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub providers: Vec<LlmProviderConfig>,
}

/// Get default endpoint for a provider
pub fn default_endpoint(name: &str) -> String {
    match name {
        "gemini" => "https://generativelanguage.googleapis.com/v1beta".to_string(),
        "anthropic" => "https://api.anthropic.com/v1".to_string(),
        "openrouter" => "https://openrouter.ai/api/v1".to_string(),
        _ => "https://api.openai.com/v1".to_string(),
    }
}

/// Get default model for a provider
pub fn default_model(name: &str) -> String {
    match name {
        "gemini" => "gemini-1.5-flash".to_string(),
        "anthropic" => "claude-3-5-haiku-20241022".to_string(),
        "openrouter" => "meta-llama/llama-3-8b-instruct:free".to_string(),
        _ => "gpt-4o-mini".to_string(),
    }
}

/// Service for chat completions with multi-provider fallback.
#[derive(Clone)]
pub struct LlmService {
    inner: Arc<LlmServiceInner>,
}

struct LlmServiceInner {
    providers: Vec<LlmProviderConfig>,
    client: Client,
}

/// Response from LLM API
#[derive(Debug, Deserialize)]
struct LlmResponse {
    choices: Option<Vec<Choice>>,
    candidates: Option<Vec<Candidate>>,     // Gemini format
    content: Option<Vec<AnthropicContent>>, // Anthropic format
    error: Option<LlmError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<Message>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LlmError {
    message: String,
}

impl LlmService {
    /// Create LLM service from config.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Request(format!("Failed to create HTTP client: {}", e)))?;

        let mut providers = config.providers.clone();
        providers.sort_by_key(|p| p.priority);

        info!(
            providers = ?providers.iter().map(|p| &p.name).collect::<Vec<_>>(),
            "LLM service initialized"
        );

        Ok(Self {
            inner: Arc::new(LlmServiceInner { providers, client }),
        })
    }

    /// Get provider names in priority order
    pub fn providers(&self) -> Vec<String> {
        self.inner.providers.iter().map(|p| p.name.clone()).collect()
    }

    pub fn is_available(&self) -> bool {
        self.inner.providers.iter().any(|p| !p.api_key.is_empty())
    }

    /// Complete a conversation with automatic provider fallback.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String> {
        if self.inner.providers.is_empty() {
            return Err(Error::NoProviders);
        }

        let mut last_error = None;

        for provider in &self.inner.providers {
            if provider.api_key.is_empty() {
                debug!(provider = %provider.name, "Skipping provider without credentials");
                continue;
            }

            match self.try_provider(provider, messages, options).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(
                        provider = %provider.name,
                        error = %e,
                        "Provider failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(Error::NoProviders))
    }

    /// Try a specific provider with retries.
    async fn try_provider(
        &self,
        provider: &LlmProviderConfig,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String> {
        let mut delay = Duration::from_millis(RETRY_DELAY_MS);
        let mut attempt = 0;

        loop {
            match self.call_provider(provider, messages, options).await {
                Ok(response) => return Ok(response),
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

    /// Make the actual API call to a provider.
    async fn call_provider(
        &self,
        provider: &LlmProviderConfig,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String> {
        debug!(
            provider = %provider.name,
            model = %provider.model,
            json = options.json,
            "Calling LLM provider"
        );

        let request = match provider.name.as_str() {
            "gemini" => self.gemini_request(provider, messages, options),
            "anthropic" => self.anthropic_request(provider, messages, options),
            _ => self.openai_request(provider, messages, options),
        };

        let response = request
            .send()
            .await
            .map_err(|e| Error::Request(format!("Request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Request(format!("Failed to read response: {}", e)))?;

        if status.as_u16() == 429 {
            return Err(Error::RateLimitExceeded);
        }

        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                message: text,
            });
        }

        parse_response(&provider.name, &text)
    }

    /// Gemini: system messages become `systemInstruction`, JSON mode sets
    /// `responseMimeType`.
    fn gemini_request(
        &self,
        provider: &LlmProviderConfig,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> RequestBuilder {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            provider.base_url, provider.model, provider.api_key
        );

        let contents: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = if m.role == Role::Assistant { "model" } else { "user" };
                json!({ "role": role, "parts": [{"text": m.content}] })
            })
            .collect();

        let mut generation_config = json!({
            "maxOutputTokens": options.max_tokens,
            "temperature": options.temperature
        });
        if options.json {
            generation_config["responseMimeType"] = json!("application/json");
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation_config
        });
        if let Some(system) = system_text(messages, false) {
            body["systemInstruction"] = json!({ "parts": [{"text": system}] });
        }

        self.inner.client.post(&url).json(&body)
    }

    /// OpenAI-compatible APIs (OpenAI, OpenRouter): JSON mode sets
    /// `response_format`.
    fn openai_request(
        &self,
        provider: &LlmProviderConfig,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> RequestBuilder {
        let url = format!("{}/chat/completions", provider.base_url);

        let mut body = json!({
            "model": provider.model,
            "messages": messages
                .iter()
                .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
                .collect::<Vec<_>>(),
            "max_tokens": options.max_tokens,
            "temperature": options.temperature
        });
        if options.json {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let mut request = self
            .inner
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", provider.api_key));

        if provider.name == "openrouter" {
            request = request
                .header("HTTP-Referer", "https://github.com/recall")
                .header("X-Title", "Recall");
        }

        request.json(&body)
    }

    /// Anthropic: system messages go in the top-level `system` field, which
    /// also carries the JSON-only instruction in JSON mode.
    fn anthropic_request(
        &self,
        provider: &LlmProviderConfig,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> RequestBuilder {
        let url = format!("{}/messages", provider.base_url);

        let mut body = json!({
            "model": provider.model,
            "messages": messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
                .collect::<Vec<_>>(),
            "max_tokens": options.max_tokens,
            "temperature": options.temperature
        });
        if let Some(system) = system_text(messages, options.json) {
            body["system"] = json!(system);
        }

        self.inner
            .client
            .post(&url)
            .header("x-api-key", &provider.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
    }
}

/// Join system messages, appending the JSON instruction when asked.
fn system_text(messages: &[ChatMessage], json_mode: bool) -> Option<String> {
    let mut parts: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    if json_mode {
        parts.push(JSON_INSTRUCTION);
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Parse response from different API formats
fn parse_response(provider: &str, text: &str) -> Result<String> {
    let response: LlmResponse = serde_json::from_str(text)
        .map_err(|e| Error::Llm(format!("Failed to parse response: {}", e)))?;

    if let Some(error) = response.error {
        return Err(Error::Llm(error.message));
    }

    if let Some(text) = response
        .content
        .and_then(|c| c.into_iter().find_map(|block| block.text))
    {
        return Ok(text);
    }

    if let Some(part) = response
        .candidates
        .and_then(|c| c.into_iter().next())
        .and_then(|c| c.content.parts.into_iter().next())
    {
        return Ok(part.text);
    }

    if let Some(choice) = response.choices.and_then(|c| c.into_iter().next()) {
        if let Some(content) = choice.message.and_then(|m| m.content) {
            return Ok(content);
        }
        if let Some(text) = choice.text {
            return Ok(text);
        }
    }

    Err(Error::Llm(format!("No content in {} response", provider)))
}

/// Extract a JSON value from LLM response text.
///
/// Tries the whole text, then a ```json fence, then any fence, then the
/// first balanced `{...}` or `[...]` span.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(json) = serde_json::from_str(trimmed) {
        return Some(json);
    }

    if let Some(start) = text.find("```json") {
        let start = start + 7;
        if let Some(end) = text[start..].find("```") {
            if let Ok(json) = serde_json::from_str(text[start..start + end].trim()) {
                return Some(json);
            }
        }
    }

    if let Some(start) = text.find("```") {
        let start = start + 3;
        // Skip language identifier if present
        let start = text[start..]
            .find('\n')
            .map(|i| start + i + 1)
            .unwrap_or(start);
        if let Some(end) = text[start..].find("```") {
            if let Ok(json) = serde_json::from_str(text[start..start + end].trim()) {
                return Some(json);
            }
        }
    }

    let start = text.find(|c: char| c == '{' || c == '[')?;
    let end = balanced_end(&text[start..])?;
    serde_json::from_str(&text[start..start + end]).ok()
}

/// Byte length of the balanced bracket span at the start of `text`,
/// ignoring brackets inside string literals.
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }

    None
}
