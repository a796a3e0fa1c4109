//! Error types for the index engine.

use crate::types::PageId;
use thiserror::Error;

/// Result type alias for tree operations
pub type Result<T> = std::result::Result<T, TreeError>;

/// Errors that can occur in the index engine
#[derive(Error, Debug)]
pub enum TreeError {
    /// I/O error from the underlying file system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested page was not found
    #[error("Page {0} not found")]
    PageNotFound(PageId),

    /// Key exceeds the maximum serialized size
    #[error("Key too large: {size} bytes (max: {max})")]
    KeyTooLarge { size: usize, max: usize },

    /// Structural damage detected; the tree needs a rebuild
    #[error("Corruption detected in index '{name}': {details}")]
    Corruption { name: String, details: String },

    /// `delete` was called on a tree that still holds entries
    #[error("Index '{name}' is not empty ({size} entries), refusing to delete")]
    TreeNotEmpty { name: String, size: i64 },

    /// Invalid page format or page kind
    #[error("Invalid page: {0}")]
    InvalidPage(String),

    /// Page cache has no evictable frames left
    #[error("Page cache exhausted: all frames are pinned")]
    CacheExhausted,

    /// Invalid operation for the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Key rejected by the serializer (arity or item type mismatch)
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Index file is missing, truncated, or has an invalid format
    #[error("Invalid index file: {0}")]
    InvalidIndexFile(String),
}

impl TreeError {
    /// Create a corruption error scoped to a tree
    pub fn corruption(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Corruption {
            name: name.into(),
            details: details.into(),
        }
    }

    /// Create an invalid page error
    pub fn invalid_page(msg: impl Into<String>) -> Self {
        Self::InvalidPage(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create an invalid key error
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    /// Create an invalid index file error
    pub fn invalid_file(msg: impl Into<String>) -> Self {
        Self::InvalidIndexFile(msg.into())
    }
}
