//! Filesystem operations module.
//!
//! This module provides the low-level transfer primitives:
//! - Copying files in two tiers: direct copy for small files (with a
//!   micro-chunked fallback) and parallel chunked copy for large ones
//! - Moving files by rename, falling back to copy + verify + delete across
//!   volumes
//! - Creating destination directories on demand
//!
//! Transfers are staged: data lands in a hidden file beside the destination
//! and only replaces the destination once the caller installs it. Every loop
//! that writes data checks the cancellation token before and after each
//! write. Failure or cancellation removes the staged data and never the
//! destination or the source.

use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::OverwritePolicy;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, info, warn};

#[cfg(unix)]
const CROSS_DEVICE_CODE: Option<i32> = Some(18); // EXDEV
#[cfg(windows)]
const CROSS_DEVICE_CODE: Option<i32> = Some(17); // ERROR_NOT_SAME_DEVICE
#[cfg(not(any(unix, windows)))]
const CROSS_DEVICE_CODE: Option<i32> = None;

/// How a move reached its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveMode {
    /// Atomic rename on the same volume
    Renamed,
    /// Rename crossed volumes; copied, verified, then source deleted
    CopiedAcrossVolumes,
}

/// A verified copy waiting beside its destination.
///
/// Dropping it removes the staged file; `install` renames it over the
/// destination.
#[derive(Debug)]
pub struct StagedFile {
    path: TempPath,
    bytes: u64,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Replace `dst` with the staged data.
    pub fn install(self, dst: &Path) -> Result<u64, EngineError> {
        let bytes = self.bytes;
        self.path
            .persist(dst)
            .map_err(|e| EngineError::from_io(dst, e.error))?;
        Ok(bytes)
    }
}

/// First phase of a move. The destination is untouched until `finish`.
#[derive(Debug)]
pub enum StagedMove {
    /// Source renamed to a hidden path beside the destination
    Renamed { staging: PathBuf, bytes: u64 },
    /// Verified copy beside the destination; source still present
    Copied(StagedFile),
}

impl StagedMove {
    pub fn bytes(&self) -> u64 {
        match self {
            StagedMove::Renamed { bytes, .. } => *bytes,
            StagedMove::Copied(file) => file.bytes(),
        }
    }

    pub fn mode(&self) -> MoveMode {
        match self {
            StagedMove::Renamed { .. } => MoveMode::Renamed,
            StagedMove::Copied(_) => MoveMode::CopiedAcrossVolumes,
        }
    }

    /// Put the staged file at `dst`; for a copy, then delete `src`.
    ///
    /// A copy that no longer verifies keeps the source and is discarded.
    pub fn finish(self, src: &Path, dst: &Path) -> Result<u64, EngineError> {
        match self {
            StagedMove::Renamed { staging, bytes } => match fs::rename(&staging, dst) {
                Ok(()) => Ok(bytes),
                Err(e) => {
                    restore(&staging, src);
                    Err(EngineError::from_io(dst, e))
                }
            },
            StagedMove::Copied(file) => {
                verify_copy(file.path(), file.bytes())?;
                let bytes = file.install(dst)?;
                fs::remove_file(src).map_err(|e| EngineError::from_io(src, e))?;
                Ok(bytes)
            }
        }
    }

    /// Undo the staging: the source is back and the destination untouched.
    pub fn abort(self, src: &Path) {
        match self {
            StagedMove::Renamed { staging, .. } => restore(&staging, src),
            StagedMove::Copied(file) => drop(file),
        }
    }
}

fn restore(staging: &Path, src: &Path) {
    if let Err(e) = fs::rename(staging, src) {
        warn!(
            staging = %staging.display(),
            src = %src.display(),
            error = %e,
            "failed to return staged source"
        );
    }
}

/// Decide whether an existing destination may be replaced.
pub fn should_transfer(source_size: u64, destination: &Path, policy: OverwritePolicy) -> bool {
    if !destination.exists() {
        return true;
    }
    match policy {
        OverwritePolicy::Skip => false,
        OverwritePolicy::Overwrite => true,
        OverwritePolicy::SmartUpdate => match fs::metadata(destination) {
            Ok(metadata) => metadata.len() != source_size,
            Err(_) => true, // Metadata read error: attempt the transfer
        },
    }
}

/// True if both paths resolve to the same existing file.
pub fn is_same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// An existing directory is not an error, so concurrent workers can call
/// this for the same destination.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    // Skip if parent is empty path (relative root)
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "Parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(|e| EngineError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}

/// Remove a temporary file; a missing file is fine.
fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove temporary file");
        }
    }
}

/// Reserve a fresh hidden file in the destination's directory.
fn staging_file(dst: &Path) -> Result<TempPath, EngineError> {
    let dir = match dst.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = format!(".{}.", name);
    tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".staging")
        .tempfile_in(dir)
        .map(NamedTempFile::into_temp_path)
        .map_err(|e| EngineError::from_io(dir, e))
}

/// Copy `src` into a staged file beside `dst`, choosing the tier by size.
///
/// The staged file is verified against the source size and carries the
/// source mtime when configured. `dst` itself is not touched.
pub fn stage_copy(
    src: &Path,
    dst: &Path,
    config: &EngineConfig,
    token: &CancellationToken,
) -> Result<StagedFile, EngineError> {
    token.check()?;
    let src_metadata = fs::metadata(src).map_err(|e| EngineError::from_io(src, e))?;
    if is_same_file(src, dst) {
        return Err(EngineError::SameFile {
            path: src.to_path_buf(),
        });
    }
    let size = src_metadata.len();
    ensure_parent_dir_exists(dst)?;

    let staging = staging_file(dst)?;
    let bytes = if size < config.small_file_threshold {
        copy_small(src, &staging, config, token)?
    } else {
        copy_large(src, &staging, size, config, token)?
    };
    token.check()?;
    verify_copy(&staging, size)?;

    // Staging files are created owner-only
    if let Err(e) = fs::set_permissions(&staging, src_metadata.permissions()) {
        debug!(path = %dst.display(), error = %e, "failed to copy permissions");
    }
    if config.preserve_mtime {
        if let Ok(mtime) = src_metadata.modified() {
            let _ = filetime::set_file_mtime(&staging, filetime::FileTime::from_system_time(mtime));
        }
    }
    Ok(StagedFile {
        path: staging,
        bytes,
    })
}

/// Copy `src` to `dst`, replacing `dst` only once the copy is complete.
///
/// Returns the number of bytes copied. On any error or cancellation an
/// existing `dst` is left as it was.
pub fn copy_file(
    src: &Path,
    dst: &Path,
    config: &EngineConfig,
    token: &CancellationToken,
) -> Result<u64, EngineError> {
    let staged = stage_copy(src, dst, config, token)?;
    token.check()?;
    staged.install(dst)
}

/// Confirm `dst` exists and has `expected` bytes.
pub fn verify_copy(dst: &Path, expected: u64) -> Result<(), EngineError> {
    let actual = fs::metadata(dst).ok().map(|m| m.len());
    if actual == Some(expected) {
        Ok(())
    } else {
        Err(EngineError::CopyVerificationFailed {
            path: dst.to_path_buf(),
            expected,
            actual,
        })
    }
}

fn copy_small(
    src: &Path,
    dst: &Path,
    config: &EngineConfig,
    token: &CancellationToken,
) -> Result<u64, EngineError> {
    token.check()?;
    match fs::copy(src, dst) {
        Ok(bytes) => {
            token.check()?;
            Ok(bytes)
        }
        Err(e) => {
            debug!(src = %src.display(), error = %e, "direct copy failed, retrying in micro chunks");
            copy_micro_chunked(src, dst, config.micro_chunk_size, token)
        }
    }
}

/// Copy in tiny chunks, checking for cancellation around every write.
fn copy_micro_chunked(
    src: &Path,
    dst: &Path,
    chunk_size: usize,
    token: &CancellationToken,
) -> Result<u64, EngineError> {
    token.check()?;
    let mut reader = File::open(src).map_err(|e| EngineError::from_io(src, e))?;
    let mut writer = File::create(dst).map_err(|e| EngineError::from_io(dst, e))?;
    copy_stream(&mut reader, &mut writer, u64::MAX, chunk_size, token)
        .map_err(|e| e.into_engine_error(src, dst))
}

enum StreamError {
    Cancelled,
    Read(io::Error),
    Write(io::Error),
}

impl StreamError {
    fn into_engine_error(self, src: &Path, dst: &Path) -> EngineError {
        match self {
            StreamError::Cancelled => EngineError::Cancelled,
            StreamError::Read(e) => EngineError::from_io(src, e),
            StreamError::Write(e) => EngineError::from_io(dst, e),
        }
    }
}

/// Copy up to `limit` bytes in `buffer_size` pieces, checking the token
/// before and after each write.
fn copy_stream<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    limit: u64,
    buffer_size: usize,
    token: &CancellationToken,
) -> Result<u64, StreamError> {
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut copied = 0u64;
    while copied < limit {
        if token.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        let want = (limit - copied).min(buffer.len() as u64) as usize;
        let read = match reader.read(&mut buffer[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StreamError::Read(e)),
        };
        writer
            .write_all(&buffer[..read])
            .map_err(StreamError::Write)?;
        copied += read as u64;
        if token.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
    }
    writer.flush().map_err(StreamError::Write)?;
    Ok(copied)
}

/// Temporary file holding chunk `index` of `dst`.
fn chunk_path(dst: &Path, index: usize) -> PathBuf {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dst.with_file_name(format!(".{}.chunk{}.part", name, index))
}

fn copy_chunk(
    src: &Path,
    part: &Path,
    offset: u64,
    len: u64,
    buffer_size: usize,
    token: &CancellationToken,
) -> Result<(), EngineError> {
    token.check()?;
    let mut reader = File::open(src).map_err(|e| EngineError::from_io(src, e))?;
    reader
        .seek(SeekFrom::Start(offset))
        .map_err(|e| EngineError::from_io(src, e))?;
    let mut writer = File::create(part).map_err(|e| EngineError::from_io(part, e))?;
    let copied = copy_stream(&mut reader, &mut writer, len, buffer_size, token)
        .map_err(|e| e.into_engine_error(src, part))?;
    if copied != len {
        return Err(EngineError::CopyVerificationFailed {
            path: part.to_path_buf(),
            expected: len,
            actual: Some(copied),
        });
    }
    Ok(())
}

/// Parallel chunked copy of a large file into `dst`, a staging path.
///
/// The file is split into equal chunks, each copied by one of a bounded pool
/// of chunk workers into its own temporary file. The temporaries are then
/// concatenated strictly in chunk order. A failing chunk cancels its
/// siblings through a child token; the batch token is only observed. Chunk
/// files are always removed; `dst` is left to its owner.
fn copy_large(
    src: &Path,
    dst: &Path,
    size: u64,
    config: &EngineConfig,
    token: &CancellationToken,
) -> Result<u64, EngineError> {
    let chunk_size = config.chunk_size_for(size);
    let chunk_count = size.div_ceil(chunk_size) as usize;
    let parts: Vec<PathBuf> = (0..chunk_count).map(|i| chunk_path(dst, i)).collect();
    let workers = config.chunk_workers.min(chunk_count).max(1);
    debug!(
        src = %src.display(),
        size,
        chunk_size,
        chunk_count,
        workers,
        "starting chunked copy"
    );

    let file_token = token.child_token();
    let failure: Mutex<Option<(usize, EngineError)>> = Mutex::new(None);
    let (sender, receiver) = crossbeam_channel::unbounded::<usize>();
    for index in 0..chunk_count {
        let _ = sender.send(index);
    }
    drop(sender);

    let spawned = thread::scope(|scope| {
        let mut spawned = 0usize;
        for worker in 0..workers {
            let receiver = receiver.clone();
            let file_token = &file_token;
            let failure = &failure;
            let parts = &parts;
            let handle = thread::Builder::new()
                .name(format!("chunk-{}", worker))
                .spawn_scoped(scope, move || {
                    for index in receiver.iter() {
                        if file_token.is_cancelled() {
                            break;
                        }
                        let offset = index as u64 * chunk_size;
                        let len = chunk_size.min(size - offset);
                        if let Err(e) = copy_chunk(
                            src,
                            &parts[index],
                            offset,
                            len,
                            config.copy_buffer_size,
                            file_token,
                        ) {
                            file_token.cancel();
                            let mut slot = failure.lock().unwrap_or_else(|p| p.into_inner());
                            let replace = match slot.as_ref() {
                                None => true,
                                Some((_, existing)) => existing.is_cancelled() && !e.is_cancelled(),
                            };
                            if replace {
                                *slot = Some((index, e));
                            }
                        }
                    }
                });
            match handle {
                Ok(_) => spawned += 1,
                Err(e) => warn!(error = %e, "failed to spawn chunk worker"),
            }
        }
        spawned
    });

    let cleanup = |parts: &[PathBuf]| parts.iter().for_each(|p| discard(p));

    if spawned == 0 && chunk_count > 0 {
        cleanup(&parts);
        return Err(EngineError::WorkerPool {
            message: format!("no chunk workers could be started for {}", src.display()),
        });
    }

    let failure = failure.into_inner().unwrap_or_else(|p| p.into_inner());
    if let Some((index, e)) = failure {
        cleanup(&parts);
        if token.is_cancelled() || e.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        return Err(EngineError::ChunkFailure {
            path: src.to_path_buf(),
            index,
            source: Box::new(e),
        });
    }
    if let Err(e) = token.check() {
        cleanup(&parts);
        return Err(e);
    }

    let reassembled = reassemble(&parts, dst, config.copy_buffer_size, token);
    cleanup(&parts);
    reassembled
}

/// Concatenate chunk files into `dst` in index order.
fn reassemble(
    parts: &[PathBuf],
    dst: &Path,
    buffer_size: usize,
    token: &CancellationToken,
) -> Result<u64, EngineError> {
    let reassembly = |e: io::Error| EngineError::ReassemblyFailure {
        path: dst.to_path_buf(),
        source: e,
    };
    let mut writer = File::create(dst).map_err(reassembly)?;
    let mut total = 0u64;
    for part in parts {
        let mut reader = File::open(part).map_err(reassembly)?;
        total += copy_stream(&mut reader, &mut writer, u64::MAX, buffer_size, token).map_err(
            |e| match e {
                StreamError::Cancelled => EngineError::Cancelled,
                StreamError::Read(e) | StreamError::Write(e) => reassembly(e),
            },
        )?;
    }
    writer.sync_all().map_err(reassembly)?;
    Ok(total)
}

fn is_cross_device(err: &io::Error) -> bool {
    CROSS_DEVICE_CODE.is_some() && err.raw_os_error() == CROSS_DEVICE_CODE
}

/// First phase of a move: rename the source beside the destination, or
/// stage a copy when the rename crosses volumes.
///
/// Finish with `StagedMove::finish` or roll back with `StagedMove::abort`.
pub fn stage_move(
    src: &Path,
    dst: &Path,
    config: &EngineConfig,
    token: &CancellationToken,
) -> Result<StagedMove, EngineError> {
    token.check()?;
    let size = fs::metadata(src)
        .map_err(|e| EngineError::from_io(src, e))?
        .len();
    if is_same_file(src, dst) {
        return Err(EngineError::SameFile {
            path: src.to_path_buf(),
        });
    }
    ensure_parent_dir_exists(dst)?;

    // Reserve a unique name, then rename the source onto it
    let staging = staging_file(dst)?
        .keep()
        .map_err(|e| EngineError::from_io(dst, e.error))?;
    match fs::rename(src, &staging) {
        Ok(()) => Ok(StagedMove::Renamed {
            staging,
            bytes: size,
        }),
        Err(e) => {
            discard(&staging);
            if is_cross_device(&e) {
                info!(src = %src.display(), dst = %dst.display(), "rename crossed volumes, copying instead");
                stage_copy(src, dst, config, token).map(StagedMove::Copied)
            } else {
                Err(EngineError::from_io(src, e))
            }
        }
    }
}

/// Move `src` to `dst` in one call.
pub fn move_file(
    src: &Path,
    dst: &Path,
    config: &EngineConfig,
    token: &CancellationToken,
) -> Result<MoveMode, EngineError> {
    let staged = stage_move(src, dst, config, token)?;
    if token.is_cancelled() {
        staged.abort(src);
        return Err(EngineError::Cancelled);
    }
    let mode = staged.mode();
    staged.finish(src, dst)?;
    Ok(mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_chunk_config() -> EngineConfig {
        EngineConfig {
            small_file_threshold: 1024,
            min_chunk_size: 1000,
            max_chunk_size: 4096,
            chunk_workers: 3,
            copy_buffer_size: 128,
            ..EngineConfig::default()
        }
    }

    fn pattern_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn leftover_parts(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .expect("Failed to read dir")
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.to_string_lossy().ends_with(".part"))
            .collect()
    }

    fn hidden_leftovers(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .expect("Failed to read dir")
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with('.'))
            })
            .collect()
    }

    #[test]
    fn test_copy_small_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("source.txt");
        let dst = temp_dir.path().join("nested").join("dest.txt");
        fs::write(&src, b"test content").expect("Failed to write source");

        let bytes = copy_file(&src, &dst, &EngineConfig::default(), &CancellationToken::new())
            .expect("Failed to copy");
        assert_eq!(bytes, 12);
        assert_eq!(fs::read(&dst).expect("Failed to read dest"), b"test content");
    }

    #[test]
    fn test_copy_large_file_in_chunks() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("big.mov");
        let dst = temp_dir.path().join("out").join("big.mov");
        let data = pattern_bytes(10_500);
        fs::write(&src, &data).expect("Failed to write source");

        let bytes = copy_file(&src, &dst, &small_chunk_config(), &CancellationToken::new())
            .expect("Failed to copy");
        assert_eq!(bytes, data.len() as u64);
        assert_eq!(fs::read(&dst).expect("Failed to read dest"), data);
        assert!(leftover_parts(&temp_dir.path().join("out")).is_empty());
    }

    #[test]
    fn test_cancelled_large_copy_leaves_nothing() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("big.mov");
        let out = temp_dir.path().join("out");
        let dst = out.join("big.mov");
        fs::write(&src, pattern_bytes(10_500)).expect("Failed to write source");

        let token = CancellationToken::new();
        token.cancel();
        let result = copy_file(&src, &dst, &small_chunk_config(), &token);
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(!dst.exists());
        if out.exists() {
            assert!(hidden_leftovers(&out).is_empty());
        }
    }

    #[test]
    fn test_chunk_failure_leaves_no_partial_files() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("big.mov");
        let dst = temp_dir.path().join("big.copy");
        fs::write(&src, pattern_bytes(10_000)).expect("Failed to write source");

        // Claim more bytes than the file holds so the last chunk comes up short
        let result = copy_large(
            &src,
            &dst,
            12_000,
            &small_chunk_config(),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(EngineError::ChunkFailure { .. })));
        assert!(!dst.exists());
        assert!(leftover_parts(temp_dir.path()).is_empty());
    }

    #[test]
    fn test_failed_copy_keeps_existing_destination() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("not_a_file");
        fs::create_dir(&src).expect("Failed to create source dir");
        let out = temp_dir.path().join("out");
        fs::create_dir(&out).expect("Failed to create out dir");
        let dst = out.join("plate.exr");
        fs::write(&dst, b"previous good delivery").expect("Failed to write dest");

        let result = copy_file(&src, &dst, &EngineConfig::default(), &CancellationToken::new());
        assert!(result.is_err());
        assert_eq!(
            fs::read(&dst).expect("Failed to read dest"),
            b"previous good delivery"
        );
        assert!(hidden_leftovers(&out).is_empty());
    }

    #[test]
    fn test_dropped_staged_copy_leaves_destination_untouched() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("plate.exr");
        let dst = temp_dir.path().join("out").join("plate.exr");
        fs::write(&src, pattern_bytes(3000)).expect("Failed to write source");
        fs::create_dir(temp_dir.path().join("out")).expect("Failed to create out dir");
        fs::write(&dst, b"old").expect("Failed to write dest");

        let staged = stage_copy(&src, &dst, &small_chunk_config(), &CancellationToken::new())
            .expect("Failed to stage");
        assert_eq!(staged.bytes(), 3000);
        let staging = staged.path().to_path_buf();
        assert!(staging.exists());
        assert_eq!(fs::read(&dst).expect("Failed to read dest"), b"old");

        drop(staged);
        assert!(!staging.exists());
        assert_eq!(fs::read(&dst).expect("Failed to read dest"), b"old");
    }

    #[test]
    fn test_copy_onto_itself_is_refused() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("plate.exr");
        fs::write(&src, b"only copy").expect("Failed to write source");
        let same = temp_dir.path().join(".").join("plate.exr");

        let result = copy_file(&src, &same, &EngineConfig::default(), &CancellationToken::new());
        assert!(matches!(result, Err(EngineError::SameFile { .. })));
        assert_eq!(fs::read(&src).expect("Failed to read source"), b"only copy");
        assert!(hidden_leftovers(temp_dir.path()).is_empty());
    }

    #[test]
    fn test_move_onto_itself_is_refused() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("plate.exr");
        fs::write(&src, b"only copy").expect("Failed to write source");

        let result = move_file(&src, &src, &EngineConfig::default(), &CancellationToken::new());
        assert!(matches!(result, Err(EngineError::SameFile { .. })));
        assert_eq!(fs::read(&src).expect("Failed to read source"), b"only copy");
    }

    #[test]
    fn test_copy_stream_stops_between_writes() {
        let token = CancellationToken::new();
        let data = pattern_bytes(64);
        let mut reader = &data[..];

        struct CancelAfterFirstWrite<'a> {
            token: &'a CancellationToken,
            written: Vec<u8>,
        }
        impl Write for CancelAfterFirstWrite<'_> {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.written.extend_from_slice(buf);
                self.token.cancel();
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut writer = CancelAfterFirstWrite {
            token: &token,
            written: Vec::new(),
        };
        let result = copy_stream(&mut reader, &mut writer, u64::MAX, 16, &token);
        assert!(matches!(result, Err(StreamError::Cancelled)));
        assert_eq!(writer.written.len(), 16);
    }

    #[test]
    fn test_micro_chunked_copy() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.bin");
        let dst = temp_dir.path().join("b.bin");
        let data = pattern_bytes(5000);
        fs::write(&src, &data).expect("Failed to write source");

        let bytes = copy_micro_chunked(&src, &dst, 1024, &CancellationToken::new())
            .expect("Failed to copy");
        assert_eq!(bytes, 5000);
        assert_eq!(fs::read(&dst).expect("Failed to read dest"), data);
    }

    #[test]
    fn test_copy_missing_source_is_path_not_found() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = copy_file(
            &temp_dir.path().join("missing.exr"),
            &temp_dir.path().join("out.exr"),
            &EngineConfig::default(),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(EngineError::PathNotFound { .. })));
    }

    #[test]
    fn test_move_same_volume_renames() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.exr");
        let dst = temp_dir.path().join("shots").join("a.exr");
        fs::write(&src, b"frame").expect("Failed to write source");

        let mode = move_file(&src, &dst, &EngineConfig::default(), &CancellationToken::new())
            .expect("Failed to move");
        assert_eq!(mode, MoveMode::Renamed);
        assert!(!src.exists());
        assert!(dst.exists());
    }

    #[test]
    fn test_cross_volume_branch_copies_then_deletes() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.exr");
        let dst = temp_dir.path().join("other").join("a.exr");
        fs::write(&src, pattern_bytes(3000)).expect("Failed to write source");

        let staged = StagedMove::Copied(
            stage_copy(&src, &dst, &small_chunk_config(), &CancellationToken::new())
                .expect("Failed to stage"),
        );
        assert_eq!(staged.mode(), MoveMode::CopiedAcrossVolumes);
        assert_eq!(staged.bytes(), 3000);
        assert!(src.exists(), "Source must survive until the move completes");
        assert!(!dst.exists());

        staged.finish(&src, &dst).expect("Failed to complete");
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).expect("Failed to read dest").len(), 3000);
    }

    #[test]
    fn test_failed_verification_keeps_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.exr");
        let dst = temp_dir.path().join("b.exr");
        fs::write(&src, b"12345").expect("Failed to write source");

        let staged = stage_copy(&src, &dst, &EngineConfig::default(), &CancellationToken::new())
            .expect("Failed to stage");
        fs::write(staged.path(), b"123").expect("Failed to truncate staged copy");

        let result = StagedMove::Copied(staged).finish(&src, &dst);
        assert!(matches!(result, Err(EngineError::CopyVerificationFailed { .. })));
        assert!(src.exists());
        assert!(!dst.exists());
        assert!(hidden_leftovers(temp_dir.path()).is_empty());
    }

    #[test]
    fn test_aborted_move_restores_source_and_destination() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.exr");
        let out = temp_dir.path().join("out");
        let dst = out.join("a.exr");
        fs::write(&src, b"new frame").expect("Failed to write source");
        fs::create_dir(&out).expect("Failed to create out dir");
        fs::write(&dst, b"previous").expect("Failed to write dest");

        let staged = stage_move(&src, &dst, &EngineConfig::default(), &CancellationToken::new())
            .expect("Failed to stage");
        assert_eq!(staged.mode(), MoveMode::Renamed);
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).expect("Failed to read dest"), b"previous");

        staged.abort(&src);
        assert_eq!(fs::read(&src).expect("Failed to read source"), b"new frame");
        assert_eq!(fs::read(&dst).expect("Failed to read dest"), b"previous");
        assert!(hidden_leftovers(&out).is_empty());
    }

    #[test]
    fn test_cancelled_move_keeps_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.exr");
        let dst = temp_dir.path().join("out").join("a.exr");
        fs::write(&src, b"frame").expect("Failed to write source");

        let token = CancellationToken::new();
        token.cancel();
        let result = move_file(&src, &dst, &EngineConfig::default(), &token);
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(src.exists());
        assert!(!dst.exists());
    }

    #[test]
    fn test_should_transfer_policies() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dst = temp_dir.path().join("a.exr");
        assert!(should_transfer(5, &dst, OverwritePolicy::Skip));

        fs::write(&dst, b"12345").expect("Failed to write dest");
        assert!(!should_transfer(5, &dst, OverwritePolicy::Skip));
        assert!(should_transfer(5, &dst, OverwritePolicy::Overwrite));
        assert!(!should_transfer(5, &dst, OverwritePolicy::SmartUpdate));
        assert!(should_transfer(6, &dst, OverwritePolicy::SmartUpdate));
    }

    #[test]
    fn test_ensure_parent_dir_exists_is_idempotent() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("subdir").join("file.txt");

        ensure_parent_dir_exists(&path).expect("Failed to create parent");
        ensure_parent_dir_exists(&path).expect("Existing parent should be fine");
        assert!(temp_dir.path().join("subdir").is_dir());
    }
}
