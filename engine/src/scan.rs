//! Directory scanning.
//!
//! The mapping stage consumes a `FileNode` tree. Any source of such a tree
//! implements `Scanner`; `DirectoryScanner` is the plain recursive walk of
//! a local directory.

use crate::error::EngineError;
use crate::model::FileNode;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Produces the file tree below a root path.
pub trait Scanner: Send + Sync {
    fn scan(&self, root: &Path) -> Result<FileNode, EngineError>;
}

/// Recursive `read_dir` walk.
///
/// Children are sorted by name so the tree, and everything derived from
/// it, is deterministic. A subdirectory that cannot be read is logged and
/// kept as an empty folder; only an unreadable root is an error.
#[derive(Debug, Clone)]
pub struct DirectoryScanner {
    /// Skip entries whose name starts with '.'
    pub skip_hidden: bool,
    /// Follow symbolic links to directories
    pub follow_links: bool,
}

impl Default for DirectoryScanner {
    fn default() -> Self {
        DirectoryScanner {
            skip_hidden: true,
            follow_links: false,
        }
    }
}

impl DirectoryScanner {
    pub fn new() -> Self {
        Self::default()
    }

    fn walk(&self, path: &Path) -> Result<Vec<FileNode>, EngineError> {
        let entries = fs::read_dir(path).map_err(|e| EngineError::from_io(path, e))?;
        let mut children = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %path.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.skip_hidden && name.starts_with('.') {
                continue;
            }
            let entry_path = entry.path();
            let metadata = if self.follow_links {
                fs::metadata(&entry_path)
            } else {
                fs::symlink_metadata(&entry_path)
            };
            let metadata = match metadata {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %entry_path.display(), error = %e, "skipping entry without metadata");
                    continue;
                }
            };

            if metadata.is_dir() {
                let grandchildren = self.walk(&entry_path).unwrap_or_else(|e| {
                    // Record the folder and continue with its siblings
                    warn!(dir = %entry_path.display(), error = %e, "failed to read directory");
                    Vec::new()
                });
                children.push(FileNode::folder(entry_path, grandchildren));
            } else if metadata.is_file() {
                children.push(FileNode::file(entry_path, metadata.len()));
            }
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }
}

impl Scanner for DirectoryScanner {
    fn scan(&self, root: &Path) -> Result<FileNode, EngineError> {
        let metadata = fs::metadata(root).map_err(|e| EngineError::from_io(root, e))?;
        if metadata.is_file() {
            return Ok(FileNode::file(root, metadata.len()));
        }
        let children = self.walk(root)?;
        debug!(root = %root.display(), entries = children.len(), "scanned directory");
        Ok(FileNode::folder(root, children))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeKind;

    #[test]
    fn test_scan_builds_sorted_tree() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        fs::create_dir_all(root.join("shots").join("SC001")).expect("Failed to create dirs");
        fs::write(root.join("b.mov"), b"12345").expect("Failed to write file");
        fs::write(root.join("a.exr"), b"1").expect("Failed to write file");
        fs::write(root.join("shots").join("SC001").join("plate.0001.exr"), b"12")
            .expect("Failed to write file");
        fs::write(root.join(".DS_Store"), b"x").expect("Failed to write file");

        let tree = DirectoryScanner::new().scan(root).expect("Failed to scan");
        assert_eq!(tree.kind, NodeKind::Folder);
        let names: Vec<&str> = tree.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a.exr", "b.mov", "shots"]);
        assert_eq!(tree.children[1].size, Some(5));
        assert_eq!(tree.children[1].extension.as_deref(), Some("mov"));

        let shot = &tree.children[2].children[0];
        assert_eq!(shot.name, "SC001");
        assert_eq!(shot.children[0].name, "plate.0001.exr");
    }

    #[test]
    fn test_hidden_entries_can_be_included() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        fs::write(temp_dir.path().join(".hidden.exr"), b"x").expect("Failed to write file");
        let scanner = DirectoryScanner {
            skip_hidden: false,
            ..DirectoryScanner::default()
        };
        let tree = scanner.scan(temp_dir.path()).expect("Failed to scan");
        assert_eq!(tree.children.len(), 1);
    }

    #[test]
    fn test_missing_root_is_path_not_found() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = DirectoryScanner::new().scan(&temp_dir.path().join("nope"));
        assert!(matches!(result, Err(EngineError::PathNotFound { .. })));
    }
}
