//! Proposal generation.
//!
//! `MappingGenerator` turns a scanned tree into one `Proposal` per sequence
//! and per standalone file:
//!
//! 1. collect the file leaves of the tree
//! 2. group them into sequences and singles
//! 3. extract tags from a representative file name and resolve a destination
//!
//! Standalone files are resolved on a fixed-size worker pool. Each item runs
//! isolated: if building its proposal panics, an `Error` proposal is emitted
//! in its place and the pool carries on.

use crate::config::MappingConfig;
use crate::error::EngineError;
use crate::model::{
    FileEntry, FileNode, PatternSet, Profile, Proposal, ProposalKind, ProposalStatus,
    SequenceGroup, TagSet,
};
use crate::patterns::{PatternExtractor, TagCache};
use crate::progress::Throttle;
use crate::resolver::{self, Resolution};
use crate::sequence;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Phase of a mapping run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingStatus {
    Starting,
    Running,
    Completed,
    /// One item failed; the run continues
    Error,
}

/// Progress update of a mapping run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEvent {
    pub status: MappingStatus,
    /// Items (sequences or files) finished so far
    pub processed: usize,
    pub total: usize,
    pub message: Option<String>,
}

/// Receives mapping progress. Called from worker threads.
pub trait MappingProgress: Send + Sync {
    fn on_event(&self, event: &MappingEvent);
}

impl<F> MappingProgress for F
where
    F: Fn(&MappingEvent) + Send + Sync,
{
    fn on_event(&self, event: &MappingEvent) {
        self(event)
    }
}

/// Funnels item completions into rate-limited events.
///
/// Status transitions always go out; `Running` updates are coalesced by the
/// throttle.
struct Reporter<'a> {
    sink: Option<&'a dyn MappingProgress>,
    total: usize,
    state: Mutex<(usize, Throttle)>,
}

impl<'a> Reporter<'a> {
    fn new(sink: Option<&'a dyn MappingProgress>, total: usize, config: &MappingConfig) -> Self {
        Reporter {
            sink,
            total,
            state: Mutex::new((0, Throttle::new(config.progress_interval()))),
        }
    }

    fn emit(&self, status: MappingStatus, processed: usize, message: Option<String>) {
        if let Some(sink) = self.sink {
            sink.on_event(&MappingEvent {
                status,
                processed,
                total: self.total,
                message,
            });
        }
    }

    fn transition(&self, status: MappingStatus, message: Option<String>) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.1.mark();
        self.emit(status, state.0, message);
    }

    fn item_done(&self, proposal: &Proposal) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.0 += 1;
        if proposal.status == ProposalStatus::Error {
            state.1.mark();
            self.emit(MappingStatus::Error, state.0, proposal.error_message.clone());
        } else if state.1.ready() {
            self.emit(MappingStatus::Running, state.0, None);
        }
    }
}

/// Every file leaf of `tree`, in tree order.
pub fn collect_files(tree: &FileNode) -> Vec<FileEntry> {
    fn walk(node: &FileNode, out: &mut Vec<FileEntry>) {
        if node.is_file() {
            out.push(FileEntry::from(node));
        }
        for child in &node.children {
            walk(child, out);
        }
    }
    let mut files = Vec::new();
    walk(tree, &mut files);
    files
}

/// Builds proposals for a tree under one profile and output root.
#[derive(Debug, Clone)]
pub struct MappingGenerator {
    extractor: Arc<PatternExtractor>,
    profile: Profile,
    root: PathBuf,
    config: MappingConfig,
}

impl MappingGenerator {
    /// Compile `patterns` and validate `profile`.
    pub fn new(
        patterns: &PatternSet,
        profile: Profile,
        root: impl Into<PathBuf>,
        config: MappingConfig,
    ) -> Result<Self, EngineError> {
        let cache = Arc::new(TagCache::new(config.cache_capacity));
        let extractor = Arc::new(PatternExtractor::with_cache(patterns, cache));
        Self::with_extractor(extractor, profile, root, config)
    }

    /// Reuse an existing extractor (and its cache).
    pub fn with_extractor(
        extractor: Arc<PatternExtractor>,
        profile: Profile,
        root: impl Into<PathBuf>,
        config: MappingConfig,
    ) -> Result<Self, EngineError> {
        profile.validate()?;
        Ok(MappingGenerator {
            extractor,
            profile,
            root: root.into(),
            config: config.validated(),
        })
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extractor(&self) -> &Arc<PatternExtractor> {
        &self.extractor
    }

    /// Generate proposals for every sequence and standalone file in `tree`.
    ///
    /// Sequences come first in grouping order, then standalone files in
    /// tree order, regardless of which worker finished first.
    pub fn generate(&self, tree: &FileNode, progress: Option<&dyn MappingProgress>) -> Vec<Proposal> {
        let files = collect_files(tree);
        let grouping = sequence::group(&files);
        let total = grouping.sequences.len() + grouping.singles.len();
        let reporter = Reporter::new(progress, total, &self.config);
        info!(
            files = files.len(),
            sequences = grouping.sequences.len(),
            singles = grouping.singles.len(),
            profile = %self.profile.name,
            "mapping started"
        );
        reporter.transition(MappingStatus::Starting, None);

        let mut proposals = Vec::with_capacity(total);
        for group in &grouping.sequences {
            let proposal = guarded(
                ProposalKind::Sequence,
                group.display_name(),
                group.files.iter().map(|f| f.path.clone()).collect(),
                || self.propose_sequence(group),
            );
            reporter.item_done(&proposal);
            proposals.push(proposal);
        }
        proposals.extend(self.propose_singles(&grouping.singles, &reporter));

        let errors = proposals
            .iter()
            .filter(|p| p.status == ProposalStatus::Error)
            .count();
        info!(proposals = proposals.len(), errors, "mapping completed");
        reporter.transition(MappingStatus::Completed, None);
        proposals
    }

    /// Resolve standalone files on the worker pool, keeping input order.
    fn propose_singles(&self, singles: &[FileEntry], reporter: &Reporter<'_>) -> Vec<Proposal> {
        let propose = |file: &FileEntry| {
            let proposal = guarded(
                ProposalKind::File,
                file.name.clone(),
                vec![file.path.clone()],
                || self.propose_file(file),
            );
            reporter.item_done(&proposal);
            proposal
        };

        let mut slots: Vec<Option<Proposal>> = vec![None; singles.len()];
        let workers = self.config.workers.min(singles.len());
        if workers > 0 {
            let (work_tx, work_rx) = crossbeam_channel::unbounded::<usize>();
            let (done_tx, done_rx) = crossbeam_channel::unbounded::<(usize, Proposal)>();
            for index in 0..singles.len() {
                let _ = work_tx.send(index);
            }
            drop(work_tx);

            thread::scope(|scope| {
                for worker in 0..workers {
                    let work_rx = work_rx.clone();
                    let done_tx = done_tx.clone();
                    let propose = &propose;
                    let spawned = thread::Builder::new()
                        .name(format!("mapping-{}", worker))
                        .spawn_scoped(scope, move || {
                            for index in work_rx.iter() {
                                let _ = done_tx.send((index, propose(&singles[index])));
                            }
                        });
                    if let Err(e) = spawned {
                        warn!(error = %e, "failed to spawn mapping worker");
                    }
                }
            });
            drop(done_tx);
            for (index, proposal) in done_rx.try_iter() {
                slots[index] = Some(proposal);
            }
        }

        // Anything no worker picked up (no pool at all) is resolved inline
        singles
            .iter()
            .zip(slots)
            .map(|(file, slot)| slot.unwrap_or_else(|| propose(file)))
            .collect()
    }

    /// Proposal for one standalone file.
    pub fn propose_file(&self, file: &FileEntry) -> Result<Proposal, EngineError> {
        if file.name.is_empty() {
            return Err(EngineError::Unmappable {
                name: file.path.display().to_string(),
                reason: "file has no name".to_string(),
            });
        }
        let tags = self.extractor.extract_tags(&file.name);
        let resolution = resolver::resolve(&self.root, &self.profile.rules, &file.name, &tags);
        debug!(file = %file.name, status = ?status_for(&tags, &resolution), "file mapped");
        Ok(build(
            ProposalKind::File,
            file.name.clone(),
            vec![file.path.clone()],
            tags,
            resolution,
            file.size,
            None,
        ))
    }

    /// Proposal for a whole sequence, tagged from its first frame.
    ///
    /// Every member is then checked on its own; frames that are unusable or
    /// would resolve elsewhere, and gaps in the frame range, are reported as
    /// warnings on the one proposal.
    pub fn propose_sequence(&self, group: &SequenceGroup) -> Result<Proposal, EngineError> {
        let Some(first) = group.representative() else {
            return Err(EngineError::Unmappable {
                name: group.display_name(),
                reason: "sequence has no frames".to_string(),
            });
        };
        let tags = self.extractor.extract_tags(&first.name);
        let resolution = resolver::resolve(&self.root, &self.profile.rules, &first.name, &tags);
        let expected_dir = resolution.destination_dir();

        let mut warnings = Vec::new();
        for (frame, member) in group.frames.iter().zip(&group.files) {
            if let Err(reason) = self.validate_member(group, member, expected_dir.as_deref()) {
                warnings.push(format!("frame {}: {}", frame, reason));
            }
        }
        let missing = group.missing_frames();
        if !missing.is_empty() {
            warnings.push(format!("missing frames {}", format_frame_ranges(&missing)));
        }

        let mut proposal = build(
            ProposalKind::Sequence,
            group.display_name(),
            group.files.iter().map(|f| f.path.clone()).collect(),
            tags,
            resolution,
            group.total_bytes(),
            Some(group.frame_range()),
        );
        if !warnings.is_empty() {
            debug!(sequence = %proposal.name, warnings = warnings.len(), "sequence has warnings");
        }
        proposal.warnings = warnings;
        Ok(proposal)
    }

    fn validate_member(
        &self,
        group: &SequenceGroup,
        member: &FileEntry,
        expected_dir: Option<&Path>,
    ) -> Result<(), String> {
        if member.name.is_empty() {
            return Err("file has no name".to_string());
        }
        if member.directory() != group.directory {
            return Err(format!("outside {}", group.directory.display()));
        }
        let Some(expected_dir) = expected_dir else {
            return Ok(());
        };
        let tags = self.extractor.extract_tags(&member.name);
        let resolution = resolver::resolve(&self.root, &self.profile.rules, &member.name, &tags);
        match resolution.destination_dir() {
            Some(dir) if dir == expected_dir => Ok(()),
            Some(dir) => Err(format!("would resolve to {}", dir.display())),
            None => Err("ambiguous on its own".to_string()),
        }
    }

    /// Settle an ambiguous proposal on the rule owning `keyword`.
    ///
    /// The destination is rebuilt from the proposal's tags under that rule's
    /// path and the proposal becomes `Manual`.
    pub fn choose_ambiguous_option(&self, proposal: &mut Proposal, keyword: &str) -> Result<(), EngineError> {
        let wanted = keyword.trim().to_lowercase();
        let Some(option) = proposal
            .ambiguous_options
            .iter()
            .find(|o| o.keyword.to_lowercase() == wanted)
            .cloned()
        else {
            let candidates = proposal
                .ambiguous_options
                .iter()
                .map(|o| o.keyword.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(EngineError::AmbiguousMapping {
                name: proposal.name.clone(),
                candidates: format!("'{}' is not one of [{}]", keyword, candidates),
            });
        };
        let filename = proposal
            .sources
            .first()
            .and_then(|s| s.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| proposal.name.clone());
        let destination = resolver::resolve_with_rule(&self.root, &option.path, &filename, &proposal.tags);
        let dir = destination
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        info!(proposal = %proposal.name, keyword = %option.keyword, path = %option.path, "ambiguity resolved");
        proposal.set_destination_dir(dir);
        proposal.used_default_rule = false;
        Ok(())
    }
}

fn status_for(tags: &TagSet, resolution: &Resolution) -> ProposalStatus {
    if resolution.ambiguous {
        ProposalStatus::Ambiguous
    } else if tags.has_core_tags() && !resolution.used_default_rule {
        ProposalStatus::Auto
    } else {
        ProposalStatus::Manual
    }
}

fn build(
    kind: ProposalKind,
    name: String,
    sources: Vec<PathBuf>,
    tags: TagSet,
    resolution: Resolution,
    total_bytes: u64,
    frame_range: Option<(u32, u32)>,
) -> Proposal {
    let status = status_for(&tags, &resolution);
    Proposal {
        id: Uuid::new_v4(),
        kind,
        name,
        sources,
        destination_dir: resolution.destination_dir(),
        tags,
        status,
        ambiguous_options: resolution.ambiguous_options,
        error_message: None,
        warnings: Vec::new(),
        used_default_rule: resolution.used_default_rule,
        total_bytes,
        frame_range,
    }
}

/// Run `build` and turn its error into an `Error` proposal.
///
/// A panic is caught as a last resort and reported the same way.
fn guarded<F>(kind: ProposalKind, name: String, sources: Vec<PathBuf>, build: F) -> Proposal
where
    F: FnOnce() -> Result<Proposal, EngineError>,
{
    let message = match panic::catch_unwind(AssertUnwindSafe(build)) {
        Ok(Ok(proposal)) => return proposal,
        Ok(Err(e)) => e.to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };
    warn!(item = %name, error = %message, "failed to build proposal");
    Proposal::failed(kind, name, sources, message)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown error while building proposal".to_string()
    }
}

/// `[1003, 1004, 1010]` → `1003-1004, 1010`.
fn format_frame_ranges(frames: &[u32]) -> String {
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for &frame in frames {
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == frame => *end = frame,
            _ => ranges.push((frame, frame)),
        }
    }
    ranges
        .iter()
        .map(|&(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{}-{}", start, end)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
