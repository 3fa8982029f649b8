//! Error taxonomy for content repository operations

use std::path::PathBuf;
use thiserror::Error;

use crate::hash::ContentHash;

/// Errors raised by the content repository
#[derive(Debug, Error)]
pub enum ContentError {
    /// A caller-supplied path resolves outside of its root
    #[error("path '{path}' escapes its root")]
    PathTraversal { path: String },

    /// Content that should be an archive failed the magic-byte sniff
    #[error("content at '{}' is not an archive", path.display())]
    NotAnArchive { path: PathBuf },

    /// An exploded-only operation targeted flat content
    #[error("content {hash} is not exploded")]
    NotExploded { hash: ContentHash },

    /// Overwrite was forbidden and an entry already exists; nothing was written
    #[error("exploded content {hash} already has an entry at '{path}'")]
    ExplodedContentConflict { hash: ContentHash, path: String },

    /// A reader gave up waiting on a location held by a removal
    #[error("timed out after {timeout_ms}ms waiting for the lock on content {hash}")]
    ContentLockTimeout { hash: ContentHash, timeout_ms: u64 },

    /// A resolved path (possibly crossing archive boundaries) has no entry
    #[error("file '{path}' not found")]
    FileNotFound { path: String },

    /// No artifact is stored under the hash
    #[error("content {hash} not found")]
    ContentNotFound { hash: ContentHash },

    #[error("invalid content hash '{value}': {reason}")]
    InvalidHash { value: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ContentError {
    pub(crate) fn traversal(path: impl Into<String>) -> Self {
        Self::PathTraversal { path: path.into() }
    }

    pub(crate) fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound { path: path.into() }
    }
}

/// Result type for content repository operations
pub type Result<T> = std::result::Result<T, ContentError>;
