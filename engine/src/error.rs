//! Error types for the ingest engine.
//!
//! `EngineError` covers both batch-level failures (a worker pool that cannot
//! be brought up, an unknown batch id) and the per-item failures that the
//! transfer engine records against a single file or proposal. Per-item errors
//! are never propagated to sibling work; they are stringified into the
//! `ProgressState` / `BatchReport` of the batch they belong to.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the mapping and transfer pipeline.
///
/// A cross-volume move is not an error: it is reported as
/// `MoveMode::CopiedAcrossVolumes`. Neither is a pattern that fails to
/// compile, which falls back to substring matching (`MatchBranch::Substring`).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Source or destination path does not exist
    #[error("Path not found: {}", path.display())]
    PathNotFound { path: PathBuf },

    /// Access to a path was refused by the OS
    #[error("Permission denied: {}", path.display())]
    PermissionDenied { path: PathBuf, source: io::Error },

    /// Destination missing or its size differs from the source after a copy
    #[error(
        "Copy verification failed for {}: expected {expected} bytes, found {actual:?}",
        path.display()
    )]
    CopyVerificationFailed {
        path: PathBuf,
        expected: u64,
        actual: Option<u64>,
    },

    /// One chunk of a parallel copy failed; siblings were cancelled
    #[error("Chunk {index} of {} failed: {source}", path.display())]
    ChunkFailure {
        path: PathBuf,
        index: usize,
        #[source]
        source: Box<EngineError>,
    },

    /// Concatenating chunk files into the destination failed
    #[error("Failed to reassemble {}", path.display())]
    ReassemblyFailure { path: PathBuf, source: io::Error },

    /// A scanned item cannot be turned into a proposal
    #[error("Cannot map {name}: {reason}")]
    Unmappable { name: String, reason: String },

    /// Source and destination resolve to the same file
    #[error("Source and destination are the same file: {}", path.display())]
    SameFile { path: PathBuf },

    /// The operation observed a cancellation request
    #[error("Operation cancelled")]
    Cancelled,

    /// A proposal without a unique destination was submitted for transfer
    #[error("Ambiguous mapping for {name}: candidates {candidates}")]
    AmbiguousMapping { name: String, candidates: String },

    /// Generic I/O failure on a path
    #[error("I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    /// Failed to create a destination directory
    #[error("Failed to create directory: {}", path.display())]
    DirectoryCreationFailed { path: PathBuf, source: io::Error },

    /// A folder-rule profile failed load-time validation
    #[error("Invalid profile '{profile}': {reason}")]
    InvalidProfile { profile: String, reason: String },

    /// Engine or mapping configuration is unusable
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// No batch with this id was ever submitted to the engine
    #[error("Unknown batch: {0}")]
    UnknownBatch(Uuid),

    /// A worker pool could not be constructed; aborts the whole batch
    #[error("Worker pool failure: {message}")]
    WorkerPool { message: String },

    /// Progress snapshot could not be written or read
    #[error("Progress store error at {}: {message}", path.display())]
    Persistence { path: PathBuf, message: String },
}

impl EngineError {
    /// Map an `io::Error` on `path` to the matching taxonomy variant.
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::PathNotFound {
                path: path.to_path_buf(),
            },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                path: path.to_path_buf(),
                source: err,
            },
            _ => Self::Io {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }

    /// True if this error is, or wraps, a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::ChunkFailure { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::PermissionDenied { source, .. }
            | Self::ReassemblyFailure { source, .. }
            | Self::Io { source, .. }
            | Self::DirectoryCreationFailed { source, .. } => source.raw_os_error(),
            Self::ChunkFailure { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}
