//! Engine and mapping configuration.
//!
//! Both structs deserialize from JSON with every field optional (missing
//! fields take the defaults below) and are normalized by `validated()`
//! before use.

use crate::error::EngineError;
use crate::model::OverwritePolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Settings for the transfer engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// File workers per batch
    pub file_workers: usize,
    /// Chunk workers per large-file copy
    pub chunk_workers: usize,
    /// Upper bound on `file_workers * chunk_workers`
    pub max_threads: usize,
    /// Files below this size are copied in one go
    pub small_file_threshold: u64,
    /// Chunk size of the small-file fallback loop
    pub micro_chunk_size: usize,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    /// Read/write buffer inside a large-file chunk
    pub copy_buffer_size: usize,
    /// Minimum spacing of coalesced progress updates
    pub progress_interval_ms: u64,
    pub overwrite: OverwritePolicy,
    pub preserve_mtime: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            file_workers: 4,
            chunk_workers: 4,
            max_threads: 64,
            small_file_threshold: 10 * MIB,
            micro_chunk_size: KIB as usize,
            min_chunk_size: MIB,
            max_chunk_size: 64 * MIB,
            copy_buffer_size: 256 * KIB as usize,
            progress_interval_ms: 500,
            overwrite: OverwritePolicy::Overwrite,
            preserve_mtime: true,
        }
    }
}

impl EngineConfig {
    /// Normalize the configuration.
    ///
    /// Zero counts and sizes are raised to 1, and `chunk_workers` shrinks
    /// until both pool tiers together fit within `max_threads`.
    pub fn validated(mut self) -> Result<Self, EngineError> {
        if self.min_chunk_size > self.max_chunk_size {
            return Err(EngineError::InvalidConfig {
                reason: format!(
                    "min_chunk_size ({}) exceeds max_chunk_size ({})",
                    self.min_chunk_size, self.max_chunk_size
                ),
            });
        }
        self.max_threads = self.max_threads.max(1);
        self.file_workers = self.file_workers.clamp(1, self.max_threads);
        self.chunk_workers = self
            .chunk_workers
            .clamp(1, (self.max_threads / self.file_workers).max(1));
        self.micro_chunk_size = self.micro_chunk_size.max(1);
        self.copy_buffer_size = self.copy_buffer_size.max(1);
        self.min_chunk_size = self.min_chunk_size.max(1);
        self.max_chunk_size = self.max_chunk_size.max(1);
        Ok(self)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Chunk size for a large file of `file_size` bytes: the file split
    /// evenly across the chunk workers, bounded by the min/max chunk size.
    pub fn chunk_size_for(&self, file_size: u64) -> u64 {
        let workers = self.chunk_workers.max(1) as u64;
        // Unvalidated configs may have min > max; max_chunk_size wins
        file_size
            .div_ceil(workers)
            .max(self.min_chunk_size)
            .min(self.max_chunk_size)
            .max(1)
    }
}

/// Settings for proposal generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Worker threads resolving standalone files
    pub workers: usize,
    pub progress_interval_ms: u64,
    /// Entries kept by the tag memo cache
    pub cache_capacity: usize,
}

impl Default for MappingConfig {
    fn default() -> Self {
        MappingConfig {
            workers: 4,
            progress_interval_ms: 500,
            cache_capacity: 4096,
        }
    }
}

impl MappingConfig {
    pub fn validated(mut self) -> Self {
        self.workers = self.workers.max(1);
        self
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}
