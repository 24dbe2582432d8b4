//! Centralized error types for recall
//!
//! This module provides a unified error handling approach using thiserror.
//! Every task boundary returns a `Result` built from these kinds; unexpected
//! errors are logged and surface as `Backend` failures rather than panics.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for recall operations
#[derive(Error, Debug)]
pub enum RecallError {
    /// Store-related errors: a transactional write or query failed.
    /// The caller sees the error and no partial state persists.
    #[error("Store error: {message}")]
    Store {
        message: String,
        source: Option<anyhow::Error>,
    },

    /// I/O operation errors
    #[error("I/O error: {path} - {message}")]
    Io { path: PathBuf, message: String },

    /// A backend (model, OCR engine, store) is disabled or offline.
    /// Tasks hitting this stay PENDING; searches skip the stream.
    #[error("Backend unavailable: {backend}")]
    Unavailable { backend: String },

    /// The backend was reachable but raised. Tasks hitting this go FAILED.
    #[error("Backend failure: {message}")]
    Backend { message: String },

    /// Parsing produced nothing usable (empty text, empty chunk list)
    #[error("Invalid data: {message}")]
    DataInvalid { message: String },

    /// The watchdog declared the work stuck
    #[error("Task timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Search operation errors
    #[error("Search error: {message}")]
    Search { message: String },

    /// File parsing errors
    #[error("Parse error: {path} - {message}")]
    Parse { path: PathBuf, message: String },

    /// Configuration errors (malformed JSON config)
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl RecallError {
    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Create an I/O error
    pub fn io(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Io {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a backend-unavailable error
    pub fn unavailable(backend: impl Into<String>) -> Self {
        Self::Unavailable {
            backend: backend.into(),
        }
    }

    /// Create a backend-failure error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Create an invalid-data error
    pub fn data_invalid(message: impl Into<String>) -> Self {
        Self::DataInvalid {
            message: message.into(),
        }
    }

    /// Create a search error
    pub fn search(message: impl Into<String>) -> Self {
        Self::Search {
            message: message.into(),
        }
    }

    /// Create a parse error
    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True when the task that hit this error should stay PENDING
    /// rather than be marked FAILED.
    pub fn leaves_task_pending(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Result type alias for recall operations
pub type Result<T> = std::result::Result<T, RecallError>;

// Conversion from std::io::Error
impl From<std::io::Error> for RecallError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

// Conversion from rusqlite::Error — every database failure is a StoreError
impl From<rusqlite::Error> for RecallError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store {
            message: err.to_string(),
            source: Some(anyhow::Error::new(err)),
        }
    }
}

// Conversion from anyhow::Error (backend adapters use anyhow internally)
impl From<anyhow::Error> for RecallError {
    fn from(err: anyhow::Error) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }
}
