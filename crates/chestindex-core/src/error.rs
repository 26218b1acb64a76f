//! Error types shared across the crate

use thiserror::Error;

/// Errors raised by the container index
#[derive(Debug, Error)]
pub enum ChestError {
    /// Container path JSON was not a JSON array
    #[error("malformed container path: {0}")]
    MalformedPath(String),

    /// Location arguments violate a structural rule
    #[error("invalid location: {0}")]
    InvalidLocation(String),

    #[error("API key missing for {0} embeddings")]
    ApiKeyMissing(&'static str),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("vector storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    /// The indexer no longer accepts work
    #[error("indexer has been shut down")]
    ShutDown,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[cfg(feature = "lancedb")]
    #[error("LanceDB error: {0}")]
    Lance(#[from] lancedb::Error),
}

pub type ChestResult<T> = Result<T, ChestError>;
