//! Core data model for the mapping and transfer pipeline.
//!
//! This module defines the data that flows between the pipeline stages:
//! - FileNode / FileEntry: the scanned tree and its file leaves
//! - SequenceGroup: files that differ only by an embedded frame number
//! - TagSet, PatternSet, FolderRule, Profile: tagging and routing inputs
//! - Proposal, Batch: planned operations and their unit of execution
//! - ProgressState: the per-batch progress snapshot

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

/// Whether a scanned node is a file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

/// One node of the tree produced by a scanner.
///
/// Mirrors the external scan shape
/// `{name, path, type: file|folder, size?, extension?, children?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileNode>,
}

impl FileNode {
    /// Build a file leaf; name and extension are derived from the path.
    pub fn file(path: impl Into<PathBuf>, size: u64) -> Self {
        let path = path.into();
        FileNode {
            name: file_name_of(&path),
            extension: Some(extension_of(&path)).filter(|e| !e.is_empty()),
            path,
            kind: NodeKind::File,
            size: Some(size),
            children: Vec::new(),
        }
    }

    /// Build a folder node holding `children`.
    pub fn folder(path: impl Into<PathBuf>, children: Vec<FileNode>) -> Self {
        let path = path.into();
        FileNode {
            name: file_name_of(&path),
            path,
            kind: NodeKind::Folder,
            size: None,
            extension: None,
            children,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }
}

/// A scanned file. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEntry {
    /// File name only, never a path
    pub name: String,
    /// Absolute source path
    pub path: PathBuf,
    /// Size in bytes (0 when the scanner did not report one)
    pub size: u64,
    /// Lowercased extension without the leading dot
    pub extension: String,
}

impl FileEntry {
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        let path = path.into();
        FileEntry {
            name: file_name_of(&path),
            extension: extension_of(&path),
            path,
            size,
        }
    }

    /// Directory holding this file.
    pub fn directory(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

impl From<&FileNode> for FileEntry {
    fn from(node: &FileNode) -> Self {
        let extension = match &node.extension {
            Some(ext) => ext.trim_start_matches('.').to_lowercase(),
            None => extension_of(&node.path),
        };
        let name = if node.name.is_empty() {
            file_name_of(&node.path)
        } else {
            node.name.clone()
        };
        FileEntry {
            name,
            path: node.path.clone(),
            size: node.size.unwrap_or(0),
            extension,
        }
    }
}

/// Files sharing a directory, base name and extension that differ only by
/// frame number.
///
/// Invariants: `files.len() == frames.len()`, `frames` strictly ascending,
/// at least two members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceGroup {
    pub base_name: String,
    /// Trailing token after the frame number (`base.0001_denoise.exr`)
    pub suffix: Option<String>,
    pub extension: String,
    pub directory: PathBuf,
    pub frames: Vec<u32>,
    pub files: Vec<FileEntry>,
}

impl SequenceGroup {
    /// First and last frame numbers.
    pub fn frame_range(&self) -> (u32, u32) {
        let first = self.frames.first().copied().unwrap_or(0);
        let last = self.frames.last().copied().unwrap_or(first);
        (first, last)
    }

    /// The file tags are extracted from: the first frame.
    pub fn representative(&self) -> Option<&FileEntry> {
        self.files.first()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Frame numbers inside the range that have no file.
    pub fn missing_frames(&self) -> Vec<u32> {
        let mut missing = Vec::new();
        for pair in self.frames.windows(2) {
            missing.extend(pair[0] + 1..pair[1]);
        }
        missing
    }

    /// Human readable name, e.g. `plate.[1001-1100].exr`.
    pub fn display_name(&self) -> String {
        let (first, last) = self.frame_range();
        match &self.suffix {
            Some(suffix) => format!(
                "{}.[{}-{}]_{}.{}",
                self.base_name, first, last, suffix, self.extension
            ),
            None => format!("{}.[{}-{}].{}", self.base_name, first, last, self.extension),
        }
    }
}

/// Semantic tags inferred from a filename. Every tag is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagSet {
    pub shot: Option<String>,
    pub task: Option<String>,
    pub asset: Option<String>,
    pub stage: Option<String>,
    pub version: Option<String>,
    pub resolution: Option<String>,
}

impl TagSet {
    /// Shot, task and version all present: enough for an automatic mapping.
    pub fn has_core_tags(&self) -> bool {
        self.shot.is_some() && self.task.is_some() && self.version.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.shot.is_none()
            && self.task.is_none()
            && self.asset.is_none()
            && self.stage.is_none()
            && self.version.is_none()
            && self.resolution.is_none()
    }
}

/// Task categories with their patterns, in document order.
///
/// Serialized as a JSON object. Order matters: the first category with a
/// matching pattern wins, so the map keeps insertion order rather than
/// sorting its keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TaskPatterns(Vec<(String, Vec<String>)>);

impl TaskPatterns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a category; a replaced category keeps its position.
    pub fn insert(&mut self, category: impl Into<String>, patterns: Vec<String>) {
        let category = category.into();
        match self.0.iter_mut().find(|(name, _)| *name == category) {
            Some(entry) => entry.1 = patterns,
            None => self.0.push((category, patterns)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, Vec<String>)> for TaskPatterns {
    fn from_iter<I: IntoIterator<Item = (K, Vec<String>)>>(iter: I) -> Self {
        let mut patterns = TaskPatterns::new();
        for (category, list) in iter {
            patterns.insert(category, list);
        }
        patterns
    }
}

impl Serialize for TaskPatterns {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (category, patterns) in &self.0 {
            map.serialize_entry(category, patterns)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for TaskPatterns {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = TaskPatterns;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of task category to pattern list")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut patterns = TaskPatterns::new();
                while let Some((category, list)) = access.next_entry::<String, Vec<String>>()? {
                    patterns.insert(category, list);
                }
                Ok(patterns)
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

/// Ordered pattern lists per tag category, as loaded from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PatternSet {
    pub shot_patterns: Vec<String>,
    pub task_patterns: TaskPatterns,
    pub version_patterns: Vec<String>,
    pub resolution_patterns: Vec<String>,
    pub asset_patterns: Vec<String>,
    pub stage_patterns: Vec<String>,
}

impl PatternSet {
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::InvalidConfig {
            reason: format!("pattern set: {}", e),
        })
    }
}

/// A destination subpath and the keywords that route files to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FolderRule {
    path: String,
    keywords: Vec<String>,
}

impl FolderRule {
    pub fn new<S: Into<String>>(path: impl Into<String>, keywords: impl IntoIterator<Item = S>) -> Self {
        FolderRule {
            path: path.into(),
            keywords: keywords.into_iter().map(Into::into).collect(),
        }
    }

    /// Destination subpath relative to the output root.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Keywords lowercased and trimmed, blanks dropped.
    pub fn normalized_keywords(&self) -> impl Iterator<Item = String> + '_ {
        self.keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
    }

    /// Case-insensitive whole-token equality against one of the keywords.
    pub fn has_keyword(&self, token: &str) -> bool {
        let token = token.trim().to_lowercase();
        !token.is_empty() && self.normalized_keywords().any(|k| k == token)
    }

    fn validate(&self) -> Result<(), String> {
        let trimmed = self.path.trim();
        if trimmed.is_empty() {
            return Err("rule with empty path".to_string());
        }
        let path = Path::new(trimmed);
        if path.is_absolute() || trimmed.starts_with('/') || trimmed.starts_with('\\') {
            return Err(format!("rule path '{}' must be relative", self.path));
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(format!("rule path '{}' must not contain '..'", self.path));
        }
        if self.normalized_keywords().next().is_none() {
            return Err(format!("rule '{}' has no keywords", self.path));
        }
        Ok(())
    }
}

/// A named, ordered list of folder rules. Order defines match priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub rules: Vec<FolderRule>,
}

impl Profile {
    /// Build and validate a profile.
    pub fn new(name: impl Into<String>, rules: Vec<FolderRule>) -> Result<Self, EngineError> {
        let profile = Profile {
            name: name.into(),
            rules,
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Parse a profile from JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let profile: Profile = serde_json::from_str(json).map_err(|e| EngineError::InvalidProfile {
            profile: "<unparsed>".to_string(),
            reason: e.to_string(),
        })?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        for rule in &self.rules {
            rule.validate().map_err(|reason| EngineError::InvalidProfile {
                profile: self.name.clone(),
                reason,
            })?;
        }
        Ok(())
    }
}

/// Whether a proposal covers one file or a whole frame sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalKind {
    File,
    Sequence,
}

/// Outcome of mapping one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    /// Shot, task and version found, routed by a keyword rule
    Auto,
    /// Routed, but needs a human look (missing tags or default rule)
    Manual,
    /// Several rules claim the item; no destination
    Ambiguous,
    /// Mapping failed for this item
    Error,
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalStatus::Auto => write!(f, "auto"),
            ProposalStatus::Manual => write!(f, "manual"),
            ProposalStatus::Ambiguous => write!(f, "ambiguous"),
            ProposalStatus::Error => write!(f, "error"),
        }
    }
}

/// One candidate destination of an ambiguous match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AmbiguousOption {
    pub keyword: String,
    pub path: String,
}

/// A planned move/copy of a file or sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: Uuid,
    pub kind: ProposalKind,
    /// Display name: the file name, or `base.[first-last].ext`
    pub name: String,
    /// Source files; a sequence lists every frame in frame order
    pub sources: Vec<PathBuf>,
    /// Destination directory; `None` iff status is Ambiguous or Error
    pub destination_dir: Option<PathBuf>,
    pub tags: TagSet,
    pub status: ProposalStatus,
    #[serde(default)]
    pub ambiguous_options: Vec<AmbiguousOption>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub used_default_rule: bool,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub frame_range: Option<(u32, u32)>,
}

impl Proposal {
    /// An Error proposal for an item that could not be mapped.
    pub fn failed(kind: ProposalKind, name: String, sources: Vec<PathBuf>, message: String) -> Self {
        Proposal {
            id: Uuid::new_v4(),
            kind,
            name,
            sources,
            destination_dir: None,
            tags: TagSet::default(),
            status: ProposalStatus::Error,
            ambiguous_options: Vec::new(),
            error_message: Some(message),
            warnings: Vec::new(),
            used_default_rule: false,
            total_bytes: 0,
            frame_range: None,
        }
    }

    /// True if this proposal can be handed to the transfer engine.
    pub fn is_transferable(&self) -> bool {
        self.destination_dir.is_some()
            && matches!(self.status, ProposalStatus::Auto | ProposalStatus::Manual)
    }

    /// Destination of one source file: the destination dir plus its file name.
    pub fn destination_for(&self, source: &Path) -> Option<PathBuf> {
        let dir = self.destination_dir.as_ref()?;
        let name = source.file_name()?;
        Some(dir.join(name))
    }

    /// Manual override of the destination, as done by a batch edit.
    pub fn set_destination_dir(&mut self, dir: impl Into<PathBuf>) {
        self.destination_dir = Some(dir.into());
        self.status = ProposalStatus::Manual;
        self.ambiguous_options.clear();
        self.error_message = None;
    }

    pub fn file_count(&self) -> usize {
        self.sources.len()
    }
}

/// Transfer operation applied to every proposal of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Copy files; sources remain unchanged
    Copy,
    /// Move files; sources removed once the destination is verified
    Move,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Copy => write!(f, "copy"),
            OperationKind::Move => write!(f, "move"),
        }
    }
}

/// Proposals executed together under one progress/cancellation scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: Uuid,
    pub proposals: Vec<Proposal>,
    pub operation: OperationKind,
}

impl Batch {
    pub fn new(proposals: Vec<Proposal>, operation: OperationKind) -> Self {
        Batch {
            id: Uuid::new_v4(),
            proposals,
            operation,
        }
    }
}

/// Policy for handling files that already exist at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    /// Don't overwrite; skip existing files
    Skip,
    /// Always overwrite existing files
    #[default]
    Overwrite,
    /// Overwrite only if the sizes differ
    SmartUpdate,
}

impl fmt::Display for OverwritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverwritePolicy::Skip => write!(f, "skip"),
            OverwritePolicy::Overwrite => write!(f, "overwrite"),
            OverwritePolicy::SmartUpdate => write!(f, "smart"),
        }
    }
}

/// Lifecycle of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Starting,
    Running,
    Completed,
    CompletedWithErrors,
    Cancelled,
    Failed,
}

impl BatchStatus {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::CompletedWithErrors
                | BatchStatus::Cancelled
                | BatchStatus::Failed
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BatchStatus::Starting => "starting",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::CompletedWithErrors => "completed with errors",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// A failure recorded against one source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub source: PathBuf,
    pub message: String,
}

/// Snapshot of a batch's progress.
///
/// Mutated only by the transfer engine's progress tracker; everything else
/// sees clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub batch_id: Uuid,
    pub total_files: usize,
    /// Files that reached a terminal state (ok, failed, skipped, cancelled)
    pub files_processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub current_file: Option<String>,
    pub status: BatchStatus,
    pub eta_seconds: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub errors: Vec<ItemError>,
}

impl ProgressState {
    pub fn new(batch_id: Uuid, total_files: usize, total_bytes: u64) -> Self {
        let now = Utc::now();
        ProgressState {
            batch_id,
            total_files,
            files_processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            cancelled: 0,
            total_bytes,
            processed_bytes: 0,
            current_file: None,
            status: BatchStatus::Starting,
            eta_seconds: None,
            started_at: now,
            updated_at: now,
            errors: Vec::new(),
        }
    }

    /// Completion percentage by file count. Byte totals of sequences are
    /// often unknown up front, so files are the reliable measure.
    pub fn percent(&self) -> f64 {
        if self.total_files == 0 {
            return if self.status.is_terminal() { 100.0 } else { 0.0 };
        }
        self.files_processed as f64 / self.total_files as f64 * 100.0
    }
}

/// File name component of a path as a String (empty if none).
pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Lowercased extension without the dot (empty if none).
pub(crate) fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}
