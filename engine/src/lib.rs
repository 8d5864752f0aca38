//! # Ingest Engine - Production Asset Mapping and Transfer Library
//!
//! A headless engine that sorts scanned production assets into a project
//! folder structure. Designed as the foundation for multiple front ends
//! (CLI, GUI, automation).
//!
//! ## Overview
//!
//! The pipeline has two halves:
//! - Mapping: scan a tree, group frame sequences, extract tags (shot, task,
//!   asset, stage, version, resolution) from file names and resolve every
//!   file or sequence to a destination under a folder-rule profile
//! - Transfer: execute the accepted proposals as copy or move batches with
//!   bounded parallelism, chunked copies of large files, cooperative
//!   cancellation and progress reporting
//!
//! ## Basic Usage
//!
//! ```no_run
//! use ingest_engine::{
//!     Batch, DirectoryScanner, EngineConfig, MappingConfig, MappingGenerator,
//!     OperationKind, PatternSet, Profile, Scanner, TransferEngine,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let patterns = PatternSet::from_json(&std::fs::read_to_string("patterns.json")?)?;
//! let profile = Profile::from_json(&std::fs::read_to_string("profile.json")?)?;
//!
//! // Plan: one proposal per sequence or file
//! let tree = DirectoryScanner::new().scan("/ingest/incoming".as_ref())?;
//! let generator = MappingGenerator::new(&patterns, profile, "/projects/show", MappingConfig::default())?;
//! let proposals = generator.generate(&tree, None);
//!
//! // Run the transferable ones
//! let accepted = proposals.into_iter().filter(|p| p.is_transferable()).collect();
//! let engine = TransferEngine::new(EngineConfig::default())?;
//! let batch_id = engine.submit(Batch::new(accepted, OperationKind::Copy))?;
//! let report = engine.wait(batch_id)?;
//! println!("{}: {} files copied", report.status, report.progress.succeeded);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (FileNode, SequenceGroup, Proposal, Batch, ProgressState)
//! - **error**: Error types and handling
//! - **config**: Engine and mapping settings
//! - **scan**: Directory scanning into a FileNode tree
//! - **patterns**: Tag extraction from file names
//! - **sequence**: Frame sequence detection
//! - **resolver**: Destination path resolution
//! - **mapping**: Proposal generation
//! - **fs_ops**: Low-level filesystem operations
//! - **transfer**: Batch execution
//! - **progress**: Progress callback trait and tracking
//! - **cancel**: Cancellation tokens
//! - **store**: Durable progress snapshots

pub mod model;
pub mod error;
pub mod config;
pub mod scan;
pub mod patterns;
pub mod sequence;
pub mod resolver;
pub mod mapping;
pub mod fs_ops;
pub mod transfer;
pub mod progress;
pub mod cancel;
pub mod store;

// Re-export main types and functions
pub use model::{
    AmbiguousOption, Batch, BatchStatus, FileEntry, FileNode, FolderRule, ItemError, NodeKind,
    OperationKind, OverwritePolicy, PatternSet, Profile, ProgressState, Proposal, ProposalKind,
    ProposalStatus, SequenceGroup, TagSet, TaskPatterns,
};
pub use error::EngineError;
pub use config::{EngineConfig, MappingConfig};
pub use scan::{DirectoryScanner, Scanner};
pub use patterns::{MatchBranch, PatternExtractor, TagCategory};
pub use resolver::{resolve, Resolution};
pub use mapping::{MappingEvent, MappingGenerator, MappingProgress, MappingStatus};
pub use fs_ops::MoveMode;
pub use transfer::{BatchReport, ItemReport, ItemState, TransferEngine};
pub use progress::{ChannelProgress, FileOutcome, FileResult, ProgressCallback, ProgressEvent};
pub use cancel::CancellationToken;
pub use store::ProgressStore;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn write_frames(dir: &Path, stem: &str, frames: std::ops::RangeInclusive<u32>) {
        for frame in frames {
            fs::write(dir.join(format!("{}.{}.exr", stem, frame)), vec![7u8; 2048])
                .expect("Failed to write frame");
        }
    }

    #[test]
    fn test_scan_map_and_transfer_pipeline() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let incoming = temp_dir.path().join("incoming");
        let project = temp_dir.path().join("project");
        fs::create_dir_all(incoming.join("day1")).expect("Failed to create source dir");
        write_frames(&incoming.join("day1"), "SC010_beautyfx_v001", 1001..=1004);
        fs::write(incoming.join("SC020_comp_v002.mov"), b"movie").expect("Failed to write file");

        let patterns = PatternSet::from_json(
            r#"{
                "shotPatterns": ["SC\\d{3}"],
                "taskPatterns": {"beautyfx": ["beautyfx"], "comp": ["comp"]},
                "versionPatterns": ["v\\d{3}"]
            }"#,
        )
        .expect("Failed to parse patterns");
        let profile = Profile::new(
            "show",
            vec![
                FolderRule::new("renders", ["beauty"]),
                FolderRule::new("fx", ["fx"]),
                FolderRule::new("comp", ["comp"]),
            ],
        )
        .expect("Failed to build profile");

        let tree = DirectoryScanner::new().scan(&incoming).expect("Failed to scan");
        let generator = MappingGenerator::new(&patterns, profile, &project, MappingConfig::default())
            .expect("Failed to build generator");
        let mut proposals = generator.generate(&tree, None);
        assert_eq!(proposals.len(), 2);

        let sequence = &mut proposals[0];
        assert_eq!(sequence.kind, ProposalKind::Sequence);
        assert_eq!(sequence.status, ProposalStatus::Ambiguous);
        assert!(!sequence.is_transferable());
        generator
            .choose_ambiguous_option(sequence, "fx")
            .expect("Failed to settle ambiguity");
        assert!(sequence.is_transferable());
        assert_eq!(proposals[1].status, ProposalStatus::Auto);

        let (tx, rx) = crossbeam_channel::unbounded();
        let engine = TransferEngine::new(EngineConfig::default())
            .expect("Failed to build engine")
            .with_callback(std::sync::Arc::new(ChannelProgress::new(tx)));
        let batch_id = engine
            .submit(Batch::new(proposals, OperationKind::Copy))
            .expect("Failed to submit batch");
        let report = engine.wait(batch_id).expect("Failed to wait for batch");

        assert_eq!(report.status, BatchStatus::Completed);
        assert!(report.success);
        assert_eq!(report.progress.succeeded, 5);
        let frames = project.join("fx").join("SC010").join("beautyfx").join("v001");
        assert!(frames.join("SC010_beautyfx_v001.1003.exr").exists());
        assert!(project.join("comp/SC020/comp/v002/SC020_comp_v002.mov").exists());
        assert!(incoming.join("SC020_comp_v002.mov").exists(), "Copy keeps sources");

        drop(engine);
        let events: Vec<ProgressEvent> = rx.try_iter().collect();
        assert!(matches!(events.first(), Some(ProgressEvent::Started(_))));
        assert!(matches!(events.last(), Some(ProgressEvent::Completed(_))));
        let completed_files = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::FileCompleted { .. }))
            .count();
        assert_eq!(completed_files, 5);
    }
}
