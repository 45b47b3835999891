//! # Error Types
//!
//! Defines the structured error hierarchy for the versioning engine using
//! `thiserror`. Each variant carries enough context for meaningful
//! diagnostics without exposing internal implementation details to callers:
//! the request router maps these onto a single structured error envelope.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type encompassing all failure modes in the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("project not initialized at {0} (run init_project first)")]
    NotInitialized(PathBuf),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("file '{path}' not found in snapshot {snapshot}")]
    FileNotInSnapshot { snapshot: String, path: String },

    #[error("content missing from store: {hash}")]
    ContentMissing { hash: String },

    #[error("no changes detected since last snapshot")]
    NoChanges,

    #[error("tag '{0}' is already used by another snapshot")]
    DuplicateTag(String),

    #[error("target already exists and force is not set: {0}")]
    PathConflict(PathBuf),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable kind label used in structured error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotInitialized(_) => "NotInitialized",
            EngineError::SnapshotNotFound(_) => "SnapshotNotFound",
            EngineError::FileNotInSnapshot { .. } => "FileNotInSnapshot",
            EngineError::ContentMissing { .. } => "ContentMissing",
            EngineError::NoChanges => "NoChanges",
            EngineError::DuplicateTag(_) => "DuplicateTag",
            EngineError::PathConflict(_) => "PathConflict",
            EngineError::Invalid(_) => "Invalid",
            EngineError::Io(_) => "IOFault",
            EngineError::Storage(_) => "Storage",
            EngineError::Internal(_) => "Internal",
        }
    }
}

impl From<glob::PatternError> for EngineError {
    fn from(e: glob::PatternError) -> Self {
        EngineError::Invalid(format!("bad glob pattern: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
