//! Error types for Recall.
//!
//! Uses thiserror for the application error; each leaf crate's error
//! converts into the matching upstream-service variant.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Resource errors
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    // Validation errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // External service errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("LLM error: {0}")]
    Llm(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Database(_) => "DATABASE_ERROR",
            Self::VectorStore(_) => "VECTOR_STORE_ERROR",
            Self::Embedding(_) => "EMBEDDING_ERROR",
            Self::Llm(_) => "LLM_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "UNKNOWN_ERROR",
        }
    }
}

// Convenience conversions
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

impl From<recall_embeddings::Error> for Error {
    fn from(err: recall_embeddings::Error) -> Self {
        Self::Embedding(err.to_string())
    }
}

impl From<recall_llm::Error> for Error {
    fn from(err: recall_llm::Error) -> Self {
        Self::Llm(err.to_string())
    }
}

impl From<recall_qdrant::Error> for Error {
    fn from(err: recall_qdrant::Error) -> Self {
        Self::VectorStore(err.to_string())
    }
}

impl From<recall_models::ModelError> for Error {
    fn from(err: recall_models::ModelError) -> Self {
        match err {
            recall_models::ModelError::DimensionMismatch { .. } => Self::Embedding(err.to_string()),
            recall_models::ModelError::Empty(_) => Self::InvalidInput(err.to_string()),
        }
    }
}
