//! Batch execution.
//!
//! `TransferEngine` runs batches of proposals against the filesystem:
//! - `submit` starts a coordinator thread per batch and returns its id
//! - the coordinator feeds one work unit per source file to a bounded pool
//!   of file workers; large files fan out further into chunk workers
//! - `cancel` flips the batch token; no unit is dispatched afterwards and
//!   in-flight workers clean up their partial destinations
//! - `progress` returns the latest published snapshot, `wait` the final
//!   report with one entry per proposal
//!
//! Individual file errors are recorded but never stop the batch. A batch
//! only ends `Failed` when its worker pool cannot be brought up.

use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::fs_ops;
use crate::model::{Batch, BatchStatus, ItemError, OperationKind, ProgressState, Proposal};
use crate::progress::{FileOutcome, FileResult, ProgressCallback, ProgressTracker};
use crate::store::ProgressStore;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Aggregate outcome of one proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Every file transferred (or was skipped alongside transferred ones)
    Completed,
    /// Some files transferred, some failed
    PartialSuccess,
    /// No file transferred
    Failed,
    /// At least one file was cancelled
    Cancelled,
    /// Every file was skipped by the overwrite policy
    Skipped,
}

/// Result of one proposal within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReport {
    pub proposal_id: Uuid,
    pub name: String,
    pub state: ItemState,
    pub files_ok: usize,
    pub files_failed: usize,
    pub files_skipped: usize,
    pub files_cancelled: usize,
    pub errors: Vec<ItemError>,
}

/// Final result of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    /// True iff no file failed
    pub success: bool,
    pub items: Vec<ItemReport>,
    pub progress: ProgressState,
}

enum Outcome {
    Pending,
    Running(JoinHandle<BatchReport>),
    Done(BatchReport),
}

struct BatchHandle {
    token: CancellationToken,
    tracker: Arc<ProgressTracker>,
    outcome: Mutex<Outcome>,
}

impl BatchHandle {
    fn outcome(&self) -> MutexGuard<'_, Outcome> {
        self.outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs batches on background threads. Each engine instance owns its
/// batches; nothing is shared between engines.
pub struct TransferEngine {
    config: EngineConfig,
    batches: DashMap<Uuid, Arc<BatchHandle>>,
    store: Option<Arc<ProgressStore>>,
    callback: Option<Arc<dyn ProgressCallback>>,
}

impl TransferEngine {
    /// Create an engine; the configuration is validated first.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Ok(TransferEngine {
            config: config.validated()?,
            batches: DashMap::new(),
            store: None,
            callback: None,
        })
    }

    /// Persist progress snapshots of every batch to `store`.
    pub fn with_store(mut self, store: ProgressStore) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Receive progress of every batch through `callback`.
    pub fn with_callback(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Ids of every batch this engine knows about.
    pub fn batch_ids(&self) -> Vec<Uuid> {
        self.batches.iter().map(|entry| *entry.key()).collect()
    }

    /// Start executing `batch` and return its id immediately.
    pub fn submit(&self, batch: Batch) -> Result<Uuid, EngineError> {
        let batch_id = batch.id;
        let total_files = batch.proposals.iter().map(Proposal::file_count).sum();
        let total_bytes = batch.proposals.iter().map(|p| p.total_bytes).sum();
        let tracker = Arc::new(ProgressTracker::new(
            ProgressState::new(batch_id, total_files, total_bytes),
            self.config.progress_interval(),
            self.callback.clone(),
            self.store.clone(),
        ));
        let handle = Arc::new(BatchHandle {
            token: CancellationToken::new(),
            tracker: Arc::clone(&tracker),
            outcome: Mutex::new(Outcome::Pending),
        });
        // Registered before the coordinator runs so callbacks can cancel it
        self.batches.insert(batch_id, Arc::clone(&handle));

        let config = self.config.clone();
        let token = handle.token.clone();
        let spawned = thread::Builder::new()
            .name(format!("batch-{}", batch_id))
            .spawn(move || run_batch(batch, &config, &token, &tracker));
        match spawned {
            Ok(join) => {
                *handle.outcome() = Outcome::Running(join);
                info!(batch = %batch_id, total_files, "batch submitted");
                Ok(batch_id)
            }
            Err(e) => {
                self.batches.remove(&batch_id);
                Err(EngineError::WorkerPool {
                    message: format!("failed to start batch coordinator: {}", e),
                })
            }
        }
    }

    /// Request cancellation. Returns false for unknown or finished batches.
    pub fn cancel(&self, batch_id: Uuid) -> bool {
        let Some(handle) = self.handle(batch_id) else {
            return false;
        };
        if handle.tracker.snapshot().status.is_terminal() {
            return false;
        }
        info!(batch = %batch_id, "cancellation requested");
        handle.token.cancel();
        true
    }

    /// Latest progress snapshot of a batch.
    pub fn progress(&self, batch_id: Uuid) -> Option<ProgressState> {
        self.handle(batch_id).map(|handle| handle.tracker.snapshot())
    }

    /// Block until the batch is terminal and return its report.
    ///
    /// Can be called repeatedly; later calls return the same report.
    pub fn wait(&self, batch_id: Uuid) -> Result<BatchReport, EngineError> {
        let handle = self
            .handle(batch_id)
            .ok_or(EngineError::UnknownBatch(batch_id))?;
        let mut outcome = handle.outcome();
        let join = match std::mem::replace(&mut *outcome, Outcome::Pending) {
            Outcome::Done(report) => {
                *outcome = Outcome::Done(report.clone());
                return Ok(report);
            }
            Outcome::Running(join) => join,
            Outcome::Pending => {
                return Err(EngineError::WorkerPool {
                    message: format!("batch {} has no coordinator", batch_id),
                })
            }
        };
        match join.join() {
            Ok(report) => {
                *outcome = Outcome::Done(report.clone());
                Ok(report)
            }
            Err(_) => {
                let state = handle.tracker.finish(BatchStatus::Failed);
                warn!(batch = %batch_id, "batch coordinator panicked");
                *outcome = Outcome::Done(BatchReport {
                    batch_id,
                    status: BatchStatus::Failed,
                    success: false,
                    items: Vec::new(),
                    progress: state,
                });
                Err(EngineError::WorkerPool {
                    message: format!("batch {} coordinator panicked", batch_id),
                })
            }
        }
    }

    /// Drop a finished batch from the engine. Returns false for unknown
    /// batches and for batches that are still running.
    pub fn forget(&self, batch_id: Uuid) -> bool {
        let removed = self
            .batches
            .remove_if(&batch_id, |_, handle| {
                handle.tracker.snapshot().status.is_terminal()
            })
            .is_some();
        if removed {
            debug!(batch = %batch_id, "batch forgotten");
        }
        removed
    }

    fn handle(&self, batch_id: Uuid) -> Option<Arc<BatchHandle>> {
        self.batches
            .get(&batch_id)
            .map(|entry| Arc::clone(entry.value()))
    }
}

/// One source file to transfer.
struct WorkUnit {
    item: usize,
    proposal_id: Uuid,
    source: PathBuf,
    destination: PathBuf,
}

/// A unit's terminal outcome, sent back to the coordinator.
struct UnitDone {
    item: usize,
    source: PathBuf,
    outcome: FileOutcome,
}

#[derive(Default)]
struct Tally {
    ok: usize,
    failed: usize,
    skipped: usize,
    cancelled: usize,
    errors: Vec<ItemError>,
}

impl Tally {
    fn add(&mut self, source: PathBuf, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Succeeded { .. } => self.ok += 1,
            FileOutcome::Skipped => self.skipped += 1,
            FileOutcome::Cancelled => self.cancelled += 1,
            FileOutcome::Failed { message } => {
                self.failed += 1;
                self.errors.push(ItemError { source, message });
            }
        }
    }

    fn state(&self) -> ItemState {
        if self.cancelled > 0 {
            ItemState::Cancelled
        } else if self.failed == 0 && self.ok == 0 && self.skipped > 0 {
            ItemState::Skipped
        } else if self.failed == 0 {
            ItemState::Completed
        } else if self.ok > 0 {
            ItemState::PartialSuccess
        } else {
            ItemState::Failed
        }
    }
}

/// Why a proposal cannot be transferred, if it cannot.
fn untransferable_reason(proposal: &Proposal) -> Option<String> {
    if proposal.is_transferable() {
        return None;
    }
    if !proposal.ambiguous_options.is_empty() {
        let candidates = proposal
            .ambiguous_options
            .iter()
            .map(|o| format!("{} -> {}", o.keyword, o.path))
            .collect::<Vec<_>>()
            .join(", ");
        let error = EngineError::AmbiguousMapping {
            name: proposal.name.clone(),
            candidates,
        };
        return Some(error.to_string());
    }
    Some(
        proposal
            .error_message
            .clone()
            .unwrap_or_else(|| format!("proposal '{}' has no destination", proposal.name)),
    )
}

/// Coordinator body: dispatch units, collect outcomes, build the report.
fn run_batch(
    batch: Batch,
    config: &EngineConfig,
    token: &CancellationToken,
    tracker: &ProgressTracker,
) -> BatchReport {
    tracker.start();
    info!(
        batch = %batch.id,
        operation = %batch.operation,
        proposals = batch.proposals.len(),
        "batch started"
    );

    let mut tallies: Vec<Tally> = batch.proposals.iter().map(|_| Tally::default()).collect();
    let mut units = Vec::new();
    for (item, proposal) in batch.proposals.iter().enumerate() {
        if let Some(message) = untransferable_reason(proposal) {
            warn!(proposal = %proposal.name, error = %message, "proposal not transferable");
            for source in &proposal.sources {
                let outcome = FileOutcome::Failed {
                    message: message.clone(),
                };
                tracker.record(FileResult {
                    proposal_id: proposal.id,
                    source: source.clone(),
                    destination: None,
                    outcome: outcome.clone(),
                });
                tallies[item].add(source.clone(), outcome);
            }
            continue;
        }
        for source in &proposal.sources {
            match proposal.destination_for(source) {
                Some(destination) => units.push(WorkUnit {
                    item,
                    proposal_id: proposal.id,
                    source: source.clone(),
                    destination,
                }),
                None => {
                    let outcome = FileOutcome::Failed {
                        message: format!("source '{}' has no file name", source.display()),
                    };
                    tracker.record(FileResult {
                        proposal_id: proposal.id,
                        source: source.clone(),
                        destination: None,
                        outcome: outcome.clone(),
                    });
                    tallies[item].add(source.clone(), outcome);
                }
            }
        }
    }

    let workers = config.file_workers.min(units.len()).max(1);
    let (work_tx, work_rx) = crossbeam_channel::bounded::<WorkUnit>(workers);
    let (done_tx, done_rx) = crossbeam_channel::unbounded::<UnitDone>();
    let operation = batch.operation;

    let (undispatched, pool_failed) = thread::scope(|scope| {
        let mut spawned = 0usize;
        for index in 0..workers {
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            let worker = thread::Builder::new()
                .name(format!("file-{}", index))
                .spawn_scoped(scope, move || {
                    for unit in work_rx.iter() {
                        let outcome = transfer_unit(&unit, operation, config, token, tracker);
                        let _ = done_tx.send(UnitDone {
                            item: unit.item,
                            source: unit.source,
                            outcome,
                        });
                    }
                });
            match worker {
                Ok(_) => spawned += 1,
                Err(e) => warn!(error = %e, "failed to spawn file worker"),
            }
        }
        drop(work_rx);

        let mut undispatched = Vec::new();
        if spawned == 0 && !units.is_empty() {
            return (units, true);
        }
        for unit in units {
            if token.is_cancelled() {
                undispatched.push(unit);
                continue;
            }
            if let Err(rejected) = work_tx.send(unit) {
                undispatched.push(rejected.into_inner());
            }
        }
        drop(work_tx);
        (undispatched, false)
    });
    drop(done_tx);

    for done in done_rx.try_iter() {
        tallies[done.item].add(done.source, done.outcome);
    }

    let leftover = if pool_failed {
        FileOutcome::Failed {
            message: "file worker pool could not be started".to_string(),
        }
    } else {
        FileOutcome::Cancelled
    };
    for unit in undispatched {
        tracker.record(FileResult {
            proposal_id: unit.proposal_id,
            source: unit.source.clone(),
            destination: Some(unit.destination),
            outcome: leftover.clone(),
        });
        tallies[unit.item].add(unit.source, leftover.clone());
    }

    let snapshot = tracker.snapshot();
    let status = if pool_failed {
        BatchStatus::Failed
    } else if token.is_cancelled() {
        BatchStatus::Cancelled
    } else if snapshot.failed > 0 {
        BatchStatus::CompletedWithErrors
    } else {
        BatchStatus::Completed
    };
    let progress = tracker.finish(status);
    info!(
        batch = %batch.id,
        status = %progress.status,
        succeeded = progress.succeeded,
        failed = progress.failed,
        skipped = progress.skipped,
        cancelled = progress.cancelled,
        "batch finished"
    );

    let items = batch
        .proposals
        .iter()
        .zip(tallies)
        .map(|(proposal, tally)| ItemReport {
            proposal_id: proposal.id,
            name: proposal.name.clone(),
            state: tally.state(),
            files_ok: tally.ok,
            files_failed: tally.failed,
            files_skipped: tally.skipped,
            files_cancelled: tally.cancelled,
            errors: tally.errors,
        })
        .collect();

    BatchReport {
        batch_id: batch.id,
        status: progress.status,
        success: progress.failed == 0,
        items,
        progress,
    }
}

/// Transfer one file and record its outcome with the tracker.
fn transfer_unit(
    unit: &WorkUnit,
    operation: OperationKind,
    config: &EngineConfig,
    token: &CancellationToken,
    tracker: &ProgressTracker,
) -> FileOutcome {
    let name = unit
        .source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tracker.file_started(&name);

    let outcome = match execute(unit, operation, config, token, tracker) {
        Ok(Some(bytes)) => {
            debug!(src = %unit.source.display(), dst = %unit.destination.display(), bytes, "file transferred");
            return FileOutcome::Succeeded { bytes };
        }
        Ok(None) => {
            debug!(dst = %unit.destination.display(), "destination exists, skipped");
            FileOutcome::Skipped
        }
        Err(e) if e.is_cancelled() => FileOutcome::Cancelled,
        Err(e) => {
            warn!(src = %unit.source.display(), error = %e, "file transfer failed");
            FileOutcome::Failed {
                message: e.to_string(),
            }
        }
    };
    tracker.record(FileResult {
        proposal_id: unit.proposal_id,
        source: unit.source.clone(),
        destination: Some(unit.destination.clone()),
        outcome: outcome.clone(),
    });
    outcome
}

/// Perform the transfer. `Ok(Some(bytes))` means the success is already
/// committed; `Ok(None)` means skipped, either by the overwrite policy or
/// because the source already sits at its destination.
///
/// Data is staged beside the destination and only installed inside the
/// commit, so a refused commit leaves the destination as it was.
fn execute(
    unit: &WorkUnit,
    operation: OperationKind,
    config: &EngineConfig,
    token: &CancellationToken,
    tracker: &ProgressTracker,
) -> Result<Option<u64>, EngineError> {
    token.check()?;
    let (src, dst) = (&unit.source, &unit.destination);
    let size = fs::metadata(src)
        .map_err(|e| EngineError::from_io(src, e))?
        .len();
    if fs_ops::is_same_file(src, dst) {
        debug!(src = %src.display(), "already in place");
        return Ok(None);
    }
    if !fs_ops::should_transfer(size, dst, config.overwrite) {
        return Ok(None);
    }

    match operation {
        OperationKind::Copy => {
            let staged = fs_ops::stage_copy(src, dst, config, token)?;
            tracker
                .commit(token, unit.proposal_id, src.clone(), dst.clone(), || {
                    staged.install(dst)
                })
                .map(Some)
        }
        OperationKind::Move => {
            let mut staged = Some(fs_ops::stage_move(src, dst, config, token)?);
            let committed = tracker.commit(
                token,
                unit.proposal_id,
                src.clone(),
                dst.clone(),
                || match staged.take() {
                    Some(staged) => staged.finish(src, dst),
                    None => Err(EngineError::Cancelled),
                },
            );
            // Commit refused before finishing: put the source back
            if let Some(staged) = staged {
                staged.abort(src);
            }
            committed.map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AmbiguousOption, OverwritePolicy, ProposalKind, ProposalStatus, TagSet};
    use std::path::Path;
    use std::sync::{OnceLock, Weak};

    fn proposal(sources: Vec<PathBuf>, destination_dir: &Path) -> Proposal {
        let total_bytes = sources
            .iter()
            .filter_map(|s| fs::metadata(s).ok())
            .map(|m| m.len())
            .sum();
        Proposal {
            id: Uuid::new_v4(),
            kind: if sources.len() > 1 {
                ProposalKind::Sequence
            } else {
                ProposalKind::File
            },
            name: "item".to_string(),
            sources,
            destination_dir: Some(destination_dir.to_path_buf()),
            tags: TagSet::default(),
            status: ProposalStatus::Manual,
            ambiguous_options: Vec::new(),
            error_message: None,
            warnings: Vec::new(),
            used_default_rule: false,
            total_bytes,
            frame_range: None,
        }
    }

    fn write_files(dir: &Path, names: &[&str], len: usize) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| {
                let path = dir.join(name);
                fs::write(&path, vec![7u8; len]).expect("Failed to write source");
                path
            })
            .collect()
    }

    fn engine() -> TransferEngine {
        TransferEngine::new(EngineConfig::default()).expect("Failed to create engine")
    }

    #[test]
    fn test_copy_batch_completes() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("in");
        let out = temp_dir.path().join("out").join("shots");
        fs::create_dir_all(&src).expect("Failed to create src");
        let sources = write_files(&src, &["a.0001.exr", "a.0002.exr", "a.0003.exr"], 64);

        let engine = engine();
        let batch = Batch::new(vec![proposal(sources.clone(), &out)], OperationKind::Copy);
        let id = engine.submit(batch).expect("Failed to submit");
        let report = engine.wait(id).expect("Failed to wait");

        assert_eq!(report.status, BatchStatus::Completed);
        assert!(report.success);
        assert_eq!(report.items[0].state, ItemState::Completed);
        assert_eq!(report.items[0].files_ok, 3);
        assert_eq!(report.progress.succeeded, 3);
        assert_eq!(report.progress.eta_seconds, Some(0.0));
        assert!(out.join("a.0002.exr").exists());
        assert!(sources.iter().all(|s| s.exists()));
    }

    #[test]
    fn test_move_batch_removes_sources() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let out = temp_dir.path().join("out");
        let sources = write_files(temp_dir.path(), &["clip.mov"], 128);

        let engine = engine();
        let id = engine
            .submit(Batch::new(vec![proposal(sources.clone(), &out)], OperationKind::Move))
            .expect("Failed to submit");
        let report = engine.wait(id).expect("Failed to wait");

        assert_eq!(report.status, BatchStatus::Completed);
        assert!(!sources[0].exists());
        assert_eq!(fs::read(out.join("clip.mov")).expect("Failed to read").len(), 128);
    }

    #[test]
    fn test_partial_sequence_failure_is_isolated() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let out = temp_dir.path().join("out");
        let mut sources = write_files(temp_dir.path(), &["s.0001.exr", "s.0002.exr"], 16);
        sources.push(temp_dir.path().join("s.0003.exr")); // missing on disk

        let engine = engine();
        let id = engine
            .submit(Batch::new(vec![proposal(sources, &out)], OperationKind::Copy))
            .expect("Failed to submit");
        let report = engine.wait(id).expect("Failed to wait");

        assert_eq!(report.status, BatchStatus::CompletedWithErrors);
        assert!(!report.success);
        let item = &report.items[0];
        assert_eq!(item.state, ItemState::PartialSuccess);
        assert_eq!((item.files_ok, item.files_failed), (2, 1));
        assert_eq!(report.progress.errors.len(), 1);
    }

    #[test]
    fn test_ambiguous_proposal_never_touches_disk() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let sources = write_files(temp_dir.path(), &["beauty_fx.exr"], 8);
        let mut ambiguous = proposal(sources.clone(), temp_dir.path());
        ambiguous.destination_dir = None;
        ambiguous.status = ProposalStatus::Ambiguous;
        ambiguous.ambiguous_options = vec![
            AmbiguousOption { keyword: "beauty".into(), path: "A".into() },
            AmbiguousOption { keyword: "fx".into(), path: "B".into() },
        ];

        let engine = engine();
        let id = engine
            .submit(Batch::new(vec![ambiguous], OperationKind::Move))
            .expect("Failed to submit");
        let report = engine.wait(id).expect("Failed to wait");

        assert_eq!(report.items[0].state, ItemState::Failed);
        assert!(report.items[0].errors[0].message.contains("beauty -> A"));
        assert!(sources[0].exists());
    }

    #[test]
    fn test_skip_policy_leaves_existing_destination() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let out = temp_dir.path().join("out");
        fs::create_dir_all(&out).expect("Failed to create out");
        fs::write(out.join("a.exr"), b"old").expect("Failed to write existing");
        let sources = write_files(temp_dir.path(), &["a.exr"], 32);

        let config = EngineConfig {
            overwrite: OverwritePolicy::Skip,
            ..EngineConfig::default()
        };
        let engine = TransferEngine::new(config).expect("Failed to create engine");
        let id = engine
            .submit(Batch::new(vec![proposal(sources, &out)], OperationKind::Copy))
            .expect("Failed to submit");
        let report = engine.wait(id).expect("Failed to wait");

        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.items[0].state, ItemState::Skipped);
        assert_eq!(report.progress.skipped, 1);
        assert_eq!(fs::read(out.join("a.exr")).expect("Failed to read"), b"old");
    }

    #[test]
    fn test_unknown_batch() {
        let engine = engine();
        let id = Uuid::new_v4();
        assert!(!engine.cancel(id));
        assert!(engine.progress(id).is_none());
        assert!(matches!(engine.wait(id), Err(EngineError::UnknownBatch(_))));
    }

    #[test]
    fn test_wait_twice_returns_same_report() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let sources = write_files(temp_dir.path(), &["x.txt"], 4);
        let engine = engine();
        let id = engine
            .submit(Batch::new(
                vec![proposal(sources, &temp_dir.path().join("o"))],
                OperationKind::Copy,
            ))
            .expect("Failed to submit");
        let first = engine.wait(id).expect("Failed to wait");
        let second = engine.wait(id).expect("Failed to wait again");
        assert_eq!(first, second);
        assert!(!engine.cancel(id), "Finished batches cannot be cancelled");
    }

    #[test]
    fn test_progress_is_persisted() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store_dir = temp_dir.path().join("state");
        let sources = write_files(temp_dir.path(), &["x.txt"], 4);
        let store = ProgressStore::open(&store_dir).expect("Failed to open store");
        let engine = engine().with_store(store.clone());
        let id = engine
            .submit(Batch::new(
                vec![proposal(sources, &temp_dir.path().join("o"))],
                OperationKind::Copy,
            ))
            .expect("Failed to submit");
        engine.wait(id).expect("Failed to wait");

        let saved = store
            .load(id)
            .expect("Failed to load")
            .expect("Snapshot should exist");
        assert_eq!(saved.status, BatchStatus::Completed);
        assert_eq!(saved.succeeded, 1);
    }

    #[test]
    fn test_forget_finished_batch() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let sources = write_files(temp_dir.path(), &["x.txt"], 4);
        let engine = engine();
        let id = engine
            .submit(Batch::new(
                vec![proposal(sources, &temp_dir.path().join("o"))],
                OperationKind::Copy,
            ))
            .expect("Failed to submit");
        engine.wait(id).expect("Failed to wait");

        assert!(engine.forget(id));
        assert!(engine.progress(id).is_none());
        assert!(!engine.batch_ids().contains(&id));
        assert!(!engine.forget(id));
        assert!(!engine.forget(Uuid::new_v4()));
    }

    #[test]
    fn test_copy_in_place_is_skipped() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let sources = write_files(temp_dir.path(), &["plate.exr"], 256);

        let config = EngineConfig {
            overwrite: OverwritePolicy::Overwrite,
            ..EngineConfig::default()
        };
        let engine = TransferEngine::new(config).expect("Failed to create engine");
        for operation in [OperationKind::Copy, OperationKind::Move] {
            let id = engine
                .submit(Batch::new(
                    vec![proposal(sources.clone(), temp_dir.path())],
                    operation,
                ))
                .expect("Failed to submit");
            let report = engine.wait(id).expect("Failed to wait");

            assert_eq!(report.status, BatchStatus::Completed);
            assert_eq!(report.progress.skipped, 1);
            assert_eq!(report.progress.failed, 0);
            assert_eq!(
                fs::read(&sources[0]).expect("Failed to read source"),
                vec![7u8; 256]
            );
        }
    }

    /// Cancels the batch from inside the progress callback once `after`
    /// files have succeeded.
    struct CancelAfter {
        after: usize,
        engine: OnceLock<Weak<TransferEngine>>,
    }

    impl ProgressCallback for CancelAfter {
        fn on_file_completed(&self, state: &ProgressState, _result: &FileResult) {
            if state.succeeded == self.after {
                if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
                    engine.cancel(state.batch_id);
                    assert!(engine.progress(state.batch_id).is_some());
                }
            }
        }
    }

    #[test]
    fn test_cancel_mid_batch_commits_nothing_after_cancel() {
        const FILE_SIZE: usize = 50 * 1024 * 1024;
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("in");
        let out = temp_dir.path().join("out");
        fs::create_dir_all(&src).expect("Failed to create src");
        let names: Vec<String> = (0..10).map(|i| format!("plate_{}.mov", i)).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let sources = write_files(&src, &name_refs, FILE_SIZE);
        let proposals = sources
            .iter()
            .map(|s| proposal(vec![s.clone()], &out))
            .collect();

        let callback = Arc::new(CancelAfter {
            after: 3,
            engine: OnceLock::new(),
        });
        let config = EngineConfig {
            file_workers: 4,
            ..EngineConfig::default()
        };
        let engine = Arc::new(
            TransferEngine::new(config)
                .expect("Failed to create engine")
                .with_callback(callback.clone()),
        );
        let _ = callback.engine.set(Arc::downgrade(&engine));

        let id = engine
            .submit(Batch::new(proposals, OperationKind::Copy))
            .expect("Failed to submit");
        let report = engine.wait(id).expect("Failed to wait");

        assert_eq!(report.status, BatchStatus::Cancelled);
        assert_eq!(report.progress.succeeded, 3);
        assert_eq!(report.progress.files_processed, 10);
        assert_eq!(report.progress.failed, 0);

        let written: Vec<PathBuf> = fs::read_dir(&out)
            .expect("Failed to read out dir")
            .filter_map(Result::ok)
            .map(|e| e.path())
            .collect();
        assert_eq!(written.len(), 3, "Only committed files may remain: {:?}", written);
        for path in written {
            let len = fs::metadata(&path).expect("Failed to stat").len();
            assert_eq!(len, FILE_SIZE as u64, "Partial file left at {}", path.display());
        }
    }

    #[test]
    fn test_cancel_mid_move_batch_keeps_unfinished_sources() {
        const FILE_SIZE: usize = 4096;
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("in");
        let out = temp_dir.path().join("out");
        fs::create_dir_all(&src).expect("Failed to create src");
        fs::create_dir_all(&out).expect("Failed to create out");
        let names: Vec<String> = (0..10).map(|i| format!("plate_{}.mov", i)).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let sources = write_files(&src, &name_refs, FILE_SIZE);
        for name in &names {
            fs::write(out.join(name), b"previous").expect("Failed to write existing");
        }
        let proposals = sources
            .iter()
            .map(|s| proposal(vec![s.clone()], &out))
            .collect();

        let callback = Arc::new(CancelAfter {
            after: 3,
            engine: OnceLock::new(),
        });
        let config = EngineConfig {
            file_workers: 4,
            overwrite: OverwritePolicy::Overwrite,
            ..EngineConfig::default()
        };
        let engine = Arc::new(
            TransferEngine::new(config)
                .expect("Failed to create engine")
                .with_callback(callback.clone()),
        );
        let _ = callback.engine.set(Arc::downgrade(&engine));

        let id = engine
            .submit(Batch::new(proposals, OperationKind::Move))
            .expect("Failed to submit");
        let report = engine.wait(id).expect("Failed to wait");

        assert_eq!(report.status, BatchStatus::Cancelled);
        assert_eq!(report.progress.succeeded, 3);
        assert_eq!(report.progress.failed, 0);

        let mut moved = 0;
        for (name, source) in names.iter().zip(&sources) {
            let delivered = fs::read(out.join(name)).expect("Failed to read destination");
            if source.exists() {
                assert_eq!(delivered, b"previous", "{} was replaced after cancel", name);
                assert_eq!(fs::metadata(source).expect("Failed to stat").len(), FILE_SIZE as u64);
            } else {
                assert_eq!(delivered.len(), FILE_SIZE, "{} lost its moved data", name);
                moved += 1;
            }
        }
        assert_eq!(moved, 3);

        let staging: Vec<PathBuf> = fs::read_dir(&out)
            .expect("Failed to read out dir")
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.to_string_lossy().ends_with(".staging"))
            .collect();
        assert!(staging.is_empty(), "Staged files left behind: {:?}", staging);
    }
}
