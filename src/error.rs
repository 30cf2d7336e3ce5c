//! Error types, grouped per domain.
//!
//! Library code returns the specific enum for its layer; `main` collapses
//! everything into `anyhow`. Subprocess anomalies never surface here; the
//! supervisor turns them into run outcomes (see `engine::supervisor`).

use std::path::PathBuf;

use thiserror::Error;

/// Configuration loading / validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("environment variable {key} is not valid UTF-8")]
    NonUnicodeEnv { key: String },

    #[error("project '{alias}': {message}")]
    InvalidProject { alias: String, message: String },
}

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database connection error: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("row decode failed: {0}")]
    Decode(String),

    #[error("migration failed: {0}")]
    Migration(String),
}

impl From<libsql::Error> for DatabaseError {
    fn from(e: libsql::Error) -> Self {
        DatabaseError::Query(e.to_string())
    }
}

/// Engine / gateway errors surfaced synchronously to adapters.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown project: {alias}")]
    UnknownProject { alias: String },

    #[error("queue full for project {alias}")]
    QueueFull { alias: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Upload validation errors.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("unknown project: {alias}")]
    UnknownProject { alias: String },

    #[error("upload exceeds maximum size ({size} > {max} bytes)")]
    TooLarge { size: usize, max: usize },

    #[error("mime type '{mime}' is not allowed")]
    MimeNotAllowed { mime: String },

    #[error("content signature does not match declared mime '{mime}'")]
    SignatureMismatch { mime: String },

    #[error("text content failed validation: {reason}")]
    InvalidText { reason: String },

    #[error("resolved path escapes the uploads root")]
    PathEscape,

    #[error("upload io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Adapter dispatch errors. Caught and logged by the bus, never propagated
/// into task state.
#[derive(Debug, Error)]
#[error("adapter '{tag}' dispatch failed: {reason}")]
pub struct ChannelError {
    pub tag: String,
    pub reason: String,
}

/// Top-level error for callers that span layers.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Upload(#[from] UploadError),
}
