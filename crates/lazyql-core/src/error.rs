//! Error types for lazyql

use std::sync::Arc;

use thiserror::Error;

/// Core error type for lazyql operations
///
/// The error is `Clone` because a single connection attempt is shared by every
/// operation waiting on it, and each of them receives the same failure.
#[derive(Error, Debug, Clone)]
pub enum LazyqlError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Connection closed")]
    Closed,

    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl LazyqlError {
    /// Whether this error reports use of an already closed connection
    pub fn is_closed(&self) -> bool {
        matches!(self, LazyqlError::Closed)
    }
}

impl From<std::io::Error> for LazyqlError {
    fn from(error: std::io::Error) -> Self {
        LazyqlError::Io(Arc::new(error))
    }
}

/// Result type alias for lazyql operations
pub type Result<T> = std::result::Result<T, LazyqlError>;
