use thiserror::Error;

/// Failures surfaced by the question-answering pipeline
#[derive(Debug, Error)]
pub enum RagError {
    /// The page could not be downloaded or returned a failure status
    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    /// The embedding model failed on an input
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// The vector index rejected an upsert
    #[error("index write failed: {0}")]
    IndexWrite(String),

    /// The vector index rejected a query
    #[error("index query failed: {0}")]
    IndexQuery(String),

    /// The generation model failed
    #[error("generation failed: {0}")]
    Generation(String),

    /// The request is missing required input
    #[error("{0}")]
    Validation(String),
}

impl RagError {
    pub fn fetch(url: &str, err: impl std::fmt::Display) -> Self {
        RagError::Fetch {
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    pub fn generation(err: impl std::fmt::Display) -> Self {
        RagError::Generation(err.to_string())
    }

    pub fn embedding(err: impl std::fmt::Display) -> Self {
        RagError::Embedding(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
