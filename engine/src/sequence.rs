//! Frame sequence detection.
//!
//! Splits a flat list of scanned files into multi-frame sequences and
//! standalone files. A file is a sequence candidate only if its extension is
//! an image frame format and its name decomposes into
//! `(base name, frame number, suffix)`.

use crate::model::{FileEntry, SequenceGroup};
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::debug;

/// Extensions of formats that are written one file per frame.
pub const SEQUENCE_EXTENSIONS: &[&str] = &[
    "exr", "dpx", "tif", "tiff", "png", "jpg", "jpeg", "tga", "cin", "hdr", "bmp", "sgi", "rgb",
    "iff", "jp2", "dng", "ari", "psd", "webp",
];

/// Largest frame number treated as plausible.
pub const MAX_FRAME: u64 = 999_999;

/// A file name split around its frame number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameName {
    pub base_name: String,
    pub frame: u32,
    pub suffix: Option<String>,
    pub extension: String,
}

/// Structural patterns in priority order.
fn frame_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // base.frame.ext
            r"^(?P<base>.+?)\.(?P<frame>\d+)\.(?P<ext>[^.]+)$",
            // base_frame.ext
            r"^(?P<base>.+?)_(?P<frame>\d+)\.(?P<ext>[^.]+)$",
            // base.frame_suffix.ext
            r"^(?P<base>.+?)\.(?P<frame>\d+)_(?P<suffix>[^.]+)\.(?P<ext>[^.]+)$",
            // base_frame_suffix.ext
            r"^(?P<base>.+?)_(?P<frame>\d+)_(?P<suffix>[^._]+)\.(?P<ext>[^.]+)$",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

pub fn is_sequence_extension(extension: &str) -> bool {
    let ext = extension.trim_start_matches('.');
    SEQUENCE_EXTENSIONS
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(ext))
}

/// Decompose a file name; the first pattern with a plausible frame wins.
pub fn decompose(file_name: &str) -> Option<FrameName> {
    frame_patterns().iter().find_map(|pattern| {
        let caps = pattern.captures(file_name)?;
        let frame: u64 = caps.name("frame")?.as_str().parse().ok()?;
        if frame > MAX_FRAME {
            return None;
        }
        let base_name = caps.name("base")?.as_str().to_string();
        Some(FrameName {
            base_name,
            frame: frame as u32,
            suffix: caps.name("suffix").map(|s| s.as_str().to_string()),
            extension: caps.name("ext")?.as_str().to_lowercase(),
        })
    })
}

/// Result of grouping: sequences plus everything that is not part of one.
#[derive(Debug, Default, Clone)]
pub struct Grouping {
    pub sequences: Vec<SequenceGroup>,
    pub singles: Vec<FileEntry>,
}

type BucketKey = (PathBuf, String, String);

/// Group `files` into sequences and standalone files.
///
/// Buckets are keyed by `(directory, base name, extension)`. A bucket with a
/// single member is demoted back to `singles`, as is a second file claiming
/// a frame number already present in its bucket. Sequences come out in the
/// order their first member appeared in the input; singles keep input order.
pub fn group(files: &[FileEntry]) -> Grouping {
    let mut buckets: HashMap<BucketKey, Vec<(u32, Option<String>, usize)>> = HashMap::new();
    let mut bucket_order: Vec<BucketKey> = Vec::new();
    let mut single_indices: Vec<usize> = Vec::new();

    for (index, file) in files.iter().enumerate() {
        if !is_sequence_extension(&file.extension) {
            single_indices.push(index);
            continue;
        }
        let Some(parts) = decompose(&file.name) else {
            single_indices.push(index);
            continue;
        };
        let key = (file.directory(), parts.base_name, file.extension.to_lowercase());
        let members = buckets.entry(key.clone()).or_insert_with(|| {
            bucket_order.push(key);
            Vec::new()
        });
        members.push((parts.frame, parts.suffix, index));
    }

    let mut sequences = Vec::new();
    for key in bucket_order {
        let Some(mut members) = buckets.remove(&key) else {
            continue;
        };
        // Frame first, then name, so a duplicate frame keeps the first name
        members.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| files[a.2].name.cmp(&files[b.2].name)));
        let mut kept: Vec<(u32, Option<String>, usize)> = Vec::with_capacity(members.len());
        for member in members {
            if kept.last().is_some_and(|last| last.0 == member.0) {
                debug!(file = %files[member.2].name, frame = member.0, "duplicate frame demoted to single");
                single_indices.push(member.2);
            } else {
                kept.push(member);
            }
        }
        if kept.len() < 2 {
            single_indices.extend(kept.iter().map(|m| m.2));
            continue;
        }
        let (directory, base_name, extension) = key;
        sequences.push(SequenceGroup {
            base_name,
            suffix: kept[0].1.clone(),
            extension,
            directory,
            frames: kept.iter().map(|m| m.0).collect(),
            files: kept.iter().map(|m| files[m.2].clone()).collect(),
        });
    }

    single_indices.sort_unstable();
    let singles = single_indices.into_iter().map(|i| files[i].clone()).collect();
    debug!(
        sequences = sequences.len(),
        input = files.len(),
        "grouped files into sequences"
    );
    Grouping { sequences, singles }
}
