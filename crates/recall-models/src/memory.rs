//! Memory model for storing long-term user knowledge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{new_id, now, ModelError};

/// Importance assigned to memories when nothing else is known.
pub const DEFAULT_IMPORTANCE: f64 = 0.5;

/// Importance assigned to insights written back by the reflector.
pub const INSIGHT_IMPORTANCE: f64 = 0.8;

/// Maximum length of a chunk title, in characters.
pub const MAX_TITLE_CHARS: usize = 100;

/// Provenance of a memory.
///
/// Free-form on the wire; the well-known values get their own variants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MemorySource {
    /// Extracted from a chat transcript
    Conversation,
    /// Produced by a research flow
    DeepResearch,
    /// Written back by the reflector agent
    AgentReflection,
    /// Saved directly without a more specific origin
    System,
    /// Any other tag supplied by a caller
    Other(String),
}

impl MemorySource {
    pub fn as_str(&self) -> &str {
        match self {
            MemorySource::Conversation => "conversation",
            MemorySource::DeepResearch => "deep-research",
            MemorySource::AgentReflection => "agent-reflection",
            MemorySource::System => "system",
            MemorySource::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "conversation" => MemorySource::Conversation,
            "deep-research" => MemorySource::DeepResearch,
            "agent-reflection" => MemorySource::AgentReflection,
            "system" | "" => MemorySource::System,
            other => MemorySource::Other(other.to_string()),
        }
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        MemorySource::System
    }
}

impl From<String> for MemorySource {
    fn from(s: String) -> Self {
        MemorySource::parse(&s)
    }
}

impl From<MemorySource> for String {
    fn from(source: MemorySource) -> Self {
        source.as_str().to_string()
    }
}

impl std::fmt::Display for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A durable, embedded unit of knowledge owned by one user.
///
/// Content is never edited in place: a change of content is a delete of
/// this record plus a new record, so the embedding always matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MemoryRecord {
    pub id: String,
    pub owner_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub title: Option<String>,
    /// Empty when the record was read back from a search without vectors.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    pub source: MemorySource,
    pub created_at: DateTime<Utc>,
    pub importance: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl MemoryRecord {
    /// Build a record from an input and its embedding.
    ///
    /// Fails if the content is blank or the embedding length differs from
    /// the collection dimension. Importance is clamped to `[0, 1]`.
    pub fn new(input: NewMemory, embedding: Vec<f32>, dimension: usize) -> Result<Self, ModelError> {
        if input.content.trim().is_empty() {
            return Err(ModelError::Empty("content"));
        }
        if input.owner_id.trim().is_empty() {
            return Err(ModelError::Empty("owner_id"));
        }
        if embedding.len() != dimension {
            return Err(ModelError::DimensionMismatch {
                expected: dimension,
                actual: embedding.len(),
            });
        }

        Ok(Self {
            id: input.id.unwrap_or_else(new_id),
            owner_id: input.owner_id,
            content: input.content.trim().to_string(),
            title: input.title,
            embedding,
            source: input.source,
            created_at: input.created_at.unwrap_or_else(now),
            importance: clamp_importance(input.importance),
            tags: normalize_tags(input.tags),
        })
    }
}

/// Input for creating a memory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NewMemory {
    /// Optional custom ID. A UUID is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub owner_id: String,
    pub content: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub source: MemorySource,
    #[serde(default = "default_importance")]
    pub importance: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Backdated creation time, mostly for imports.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl NewMemory {
    pub fn new(owner_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: None,
            owner_id: owner_id.into(),
            content: content.into(),
            title: None,
            source: MemorySource::System,
            importance: DEFAULT_IMPORTANCE,
            tags: Vec::new(),
            created_at: None,
        }
    }

    pub fn with_source(mut self, source: MemorySource) -> Self {
        self.source = source;
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

fn default_importance() -> f64 {
    DEFAULT_IMPORTANCE
}

/// Clamp an importance value to `[0, 1]`; NaN becomes the default.
pub fn clamp_importance(importance: f64) -> f64 {
    if importance.is_nan() {
        DEFAULT_IMPORTANCE
    } else {
        importance.clamp(0.0, 1.0)
    }
}

/// Lower-case, trim and de-duplicate tags, keeping first-seen order.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.as_ref().trim().to_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

/// An extraction candidate, validated but not yet embedded or stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryChunk {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl MemoryChunk {
    /// Create a chunk, enforcing the title/content invariants.
    ///
    /// Titles longer than [`MAX_TITLE_CHARS`] are truncated on a character
    /// boundary rather than rejected.
    pub fn new(
        id: impl Into<String>,
        title: &str,
        content: &str,
        tags: Vec<String>,
    ) -> Result<Self, ModelError> {
        let title = title.trim();
        let content = content.trim();
        if title.is_empty() {
            return Err(ModelError::Empty("title"));
        }
        if content.is_empty() {
            return Err(ModelError::Empty("content"));
        }

        let title = if title.chars().count() > MAX_TITLE_CHARS {
            title.chars().take(MAX_TITLE_CHARS).collect::<String>().trim_end().to_string()
        } else {
            title.to_string()
        };

        Ok(Self {
            id: id.into(),
            title,
            content: content.to_string(),
            tags: normalize_tags(tags),
        })
    }

    /// Turn the chunk into a record input owned by `owner_id`.
    pub fn into_new_memory(self, owner_id: &str, source: MemorySource) -> NewMemory {
        NewMemory {
            id: Some(self.id),
            owner_id: owner_id.to_string(),
            content: self.content,
            title: Some(self.title),
            source,
            importance: DEFAULT_IMPORTANCE,
            tags: self.tags,
            created_at: None,
        }
    }
}

/// A memory ranked by the weighted retrieval engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedMemory {
    pub id: String,
    pub text: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub similarity_score: f64,
    pub recency_score: f64,
    pub importance: f64,
    pub final_weighted_score: f64,
}
