//! Error types for the voxrelay gateway

use thiserror::Error;

use crate::protocol::{FrameError, TopicError};

/// Result type alias for voxrelay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voxrelay gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Voice frame codec error
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Topic codec error
    #[error(transparent)]
    Topic(#[from] TopicError),

    /// MQTT transport error
    #[error("mqtt error: {0}")]
    Mqtt(String),

    /// Publish wait exceeded its deadline
    #[error("publish timed out")]
    PublishTimeout,

    /// The calling context was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Speech recognition error
    #[error("asr error: {0}")]
    Asr(String),

    /// Intent classification error
    #[error("nlu error: {0}")]
    Nlu(String),

    /// Chat model error
    #[error("llm error: {0}")]
    Llm(String),

    /// Speech synthesis error
    #[error("tts error: {0}")]
    Tts(String),

    /// Caller passed an unusable argument
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// No pricing rule registered for a model
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// Rate limit backend error
    #[error("rate limit error: {0}")]
    RateLimit(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
