//! Error types for Cellforge.
//!
//! Library crates use [`CellforgeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Cellforge operations.
#[derive(Debug, thiserror::Error)]
pub enum CellforgeError {
    /// Configuration loading or validation error (missing credentials, bad TOML).
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error during page fetch or an API call.
    #[error("network error: {0}")]
    Network(String),

    /// HTML parsing, extraction, or model-output parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Embedding endpoint error.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Model inference error (HTTP status, stream decode, timeout).
    #[error("inference error: {0}")]
    Inference(String),

    /// Web search error.
    #[error("search error: {0}")]
    Search(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A dataset, column, or cell that the caller named does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CellforgeError>;

impl CellforgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a not-found error naming the missing entity.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error should reach the top-level caller rather than be
    /// recorded against a single row, source, or batch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::NotFound { .. })
    }
}
