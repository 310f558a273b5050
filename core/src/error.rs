use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport failure calling {url}: {reason}")]
    Transport { url: String, reason: String },

    #[error("No auth token available (in memory or persisted)")]
    NoTokenAvailable,

    #[error("Invalid subject identifier '{raw}': expected 11 digits")]
    InvalidSubject { raw: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EnrichResult<T> = Result<T, EnrichError>;
