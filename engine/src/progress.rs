//! Progress reporting.
//!
//! This module defines the ProgressCallback trait, which decouples the
//! transfer engine from whatever displays progress (CLI, GUI, a viewer fed
//! from the progress store), and the tracker that owns a batch's
//! `ProgressState`.
//!
//! The tracker is the single writer of the state: every mutation goes through
//! one mutex, so concurrent file workers never lose an increment. Readers get
//! clones from a separately locked "published" copy, which means
//! `TransferEngine::progress` can be called from inside a callback.

use crate::cancel::CancellationToken;
use crate::error::EngineError;
use crate::model::{BatchStatus, ItemError, ProgressState};
use crate::store::ProgressStore;
use chrono::Utc;
use crossbeam_channel::Sender;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

/// Terminal result of one file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Succeeded { bytes: u64 },
    Skipped,
    Failed { message: String },
    Cancelled,
}

/// A file transfer result as reported to callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileResult {
    pub proposal_id: Uuid,
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    pub outcome: FileOutcome,
}

/// Trait for receiving progress updates from a transfer batch.
///
/// All methods have no-op defaults. Callbacks are invoked from worker
/// threads while the batch's progress lock is held, so they must be quick;
/// they may call `TransferEngine::progress` and `TransferEngine::cancel`.
pub trait ProgressCallback: Send + Sync {
    /// Called once when the batch starts running.
    fn on_batch_started(&self, _state: &ProgressState) {}

    /// Called at most every progress interval while files are in flight.
    fn on_progress(&self, _state: &ProgressState) {}

    /// Called for every file that reaches a terminal state.
    fn on_file_completed(&self, _state: &ProgressState, _result: &FileResult) {}

    /// Called once with the terminal state.
    fn on_batch_completed(&self, _state: &ProgressState) {}
}

/// Progress updates forwarded over a channel.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Started(ProgressState),
    Progress(ProgressState),
    FileCompleted {
        state: ProgressState,
        result: FileResult,
    },
    Completed(ProgressState),
}

/// A ProgressCallback implementation that sends updates via a channel.
pub struct ChannelProgress {
    sender: Sender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        ChannelProgress { sender }
    }
}

impl ProgressCallback for ChannelProgress {
    fn on_batch_started(&self, state: &ProgressState) {
        let _ = self.sender.send(ProgressEvent::Started(state.clone()));
    }

    fn on_progress(&self, state: &ProgressState) {
        let _ = self.sender.send(ProgressEvent::Progress(state.clone()));
    }

    fn on_file_completed(&self, state: &ProgressState, result: &FileResult) {
        let _ = self.sender.send(ProgressEvent::FileCompleted {
            state: state.clone(),
            result: result.clone(),
        });
    }

    fn on_batch_completed(&self, state: &ProgressState) {
        let _ = self.sender.send(ProgressEvent::Completed(state.clone()));
    }
}

/// Rate limiter for coalescing progress updates.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Throttle {
            interval,
            last: None,
        }
    }

    /// True (and restarts the interval) if an update may go out now.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Record an update that bypassed the throttle.
    pub fn mark(&mut self) {
        self.last = Some(Instant::now());
    }
}

struct TrackerInner {
    state: ProgressState,
    throttle: Throttle,
}

/// Single-writer owner of one batch's `ProgressState`.
pub(crate) struct ProgressTracker {
    inner: Mutex<TrackerInner>,
    published: Mutex<ProgressState>,
    callback: Option<Arc<dyn ProgressCallback>>,
    store: Option<Arc<ProgressStore>>,
    started: Instant,
}

impl ProgressTracker {
    pub(crate) fn new(
        state: ProgressState,
        interval: Duration,
        callback: Option<Arc<dyn ProgressCallback>>,
        store: Option<Arc<ProgressStore>>,
    ) -> Self {
        ProgressTracker {
            published: Mutex::new(state.clone()),
            inner: Mutex::new(TrackerInner {
                state,
                throttle: Throttle::new(interval),
            }),
            callback,
            store,
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Latest published snapshot.
    pub(crate) fn snapshot(&self) -> ProgressState {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Copy the state to readers and, if asked, to the progress store.
    fn publish(&self, state: &ProgressState, persist: bool) {
        *self
            .published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state.clone();
        if persist {
            if let Some(store) = &self.store {
                if let Err(e) = store.save(state) {
                    warn!(batch = %state.batch_id, error = %e, "failed to persist progress");
                }
            }
        }
    }

    /// Starting → Running.
    pub(crate) fn start(&self) {
        let mut inner = self.lock();
        if inner.state.status.is_terminal() {
            return;
        }
        inner.state.status = BatchStatus::Running;
        inner.state.updated_at = Utc::now();
        inner.throttle.mark();
        self.publish(&inner.state, true);
        if let Some(callback) = &self.callback {
            callback.on_batch_started(&inner.state);
        }
    }

    /// Note the file a worker is about to transfer.
    pub(crate) fn file_started(&self, name: &str) {
        let mut inner = self.lock();
        if inner.state.status.is_terminal() {
            return;
        }
        inner.state.current_file = Some(name.to_string());
        inner.state.updated_at = Utc::now();
        let ready = inner.throttle.ready();
        self.publish(&inner.state, ready);
        if ready {
            if let Some(callback) = &self.callback {
                callback.on_progress(&inner.state);
            }
        }
    }

    /// Record a finished transfer unless cancellation was observed first.
    ///
    /// Under the progress lock: check `token`, run `finalize` (installing
    /// the staged file at its destination), and record the success. Returns
    /// `Err(Cancelled)` without running `finalize` if the batch was
    /// cancelled; the caller then drops the staged data and reports the
    /// file as cancelled. Errors from `finalize` are returned unrecorded as
    /// well.
    pub(crate) fn commit<F>(
        &self,
        token: &CancellationToken,
        proposal_id: Uuid,
        source: PathBuf,
        destination: PathBuf,
        finalize: F,
    ) -> Result<u64, EngineError>
    where
        F: FnOnce() -> Result<u64, EngineError>,
    {
        let mut inner = self.lock();
        if inner.state.status.is_terminal() {
            return Err(EngineError::Cancelled);
        }
        token.check()?;
        let bytes = finalize()?;
        let result = FileResult {
            proposal_id,
            source,
            destination: Some(destination),
            outcome: FileOutcome::Succeeded { bytes },
        };
        self.apply(&mut inner, &result);
        Ok(bytes)
    }

    /// Record a skipped, failed or cancelled file.
    pub(crate) fn record(&self, result: FileResult) {
        let mut inner = self.lock();
        self.apply(&mut inner, &result);
    }

    fn apply(&self, inner: &mut TrackerInner, result: &FileResult) {
        if inner.state.status.is_terminal() {
            return;
        }
        let state = &mut inner.state;
        state.files_processed += 1;
        match &result.outcome {
            FileOutcome::Succeeded { bytes } => {
                state.succeeded += 1;
                state.processed_bytes += bytes;
            }
            FileOutcome::Skipped => state.skipped += 1,
            FileOutcome::Failed { message } => {
                state.failed += 1;
                state.errors.push(ItemError {
                    source: result.source.clone(),
                    message: message.clone(),
                });
            }
            FileOutcome::Cancelled => state.cancelled += 1,
        }
        state.eta_seconds = estimate_eta(
            state.files_processed,
            state.total_files,
            self.started.elapsed(),
        );
        state.updated_at = Utc::now();
        let ready = inner.throttle.ready();
        self.publish(&inner.state, ready);
        if let Some(callback) = &self.callback {
            callback.on_file_completed(&inner.state, result);
            if ready {
                callback.on_progress(&inner.state);
            }
        }
    }

    /// Set the terminal status and flush it. Later calls are ignored.
    pub(crate) fn finish(&self, status: BatchStatus) -> ProgressState {
        let mut inner = self.lock();
        if inner.state.status.is_terminal() {
            return inner.state.clone();
        }
        inner.state.status = status;
        inner.state.current_file = None;
        inner.state.eta_seconds = match status {
            BatchStatus::Completed | BatchStatus::CompletedWithErrors => Some(0.0),
            _ => None,
        };
        inner.state.updated_at = Utc::now();
        self.publish(&inner.state, true);
        if let Some(callback) = &self.callback {
            callback.on_batch_completed(&inner.state);
        }
        inner.state.clone()
    }
}

/// Remaining time from the file rate so far; `None` before the first file.
pub fn estimate_eta(processed: usize, total: usize, elapsed: Duration) -> Option<f64> {
    if processed == 0 {
        return None;
    }
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return None;
    }
    let rate = processed as f64 / secs;
    let remaining = total.saturating_sub(processed) as f64;
    Some(remaining / rate)
}
