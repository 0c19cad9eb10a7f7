pub mod embed;
pub mod engine;

pub use embed::EmbeddingClient;
pub use engine::{KnowledgeStore, MatchReason, RetrievalEngine, RetrievedChunk};

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Embedding API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Embedding error: {0}")]
    Embedding(String),
}

pub type Result<T> = std::result::Result<T, RetrievalError>;
