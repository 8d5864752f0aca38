//! Destination path resolution.
//!
//! Given the tags of a file and an ordered list of folder rules, pick the
//! rule the file belongs to and assemble its destination:
//!
//! 1. exact, case-insensitive match of the task tag against a rule keyword,
//!    then the same for the asset tag;
//! 2. otherwise, if the task (then asset) tag *contains* keywords owned by
//!    two or more different rules, the match is ambiguous and no
//!    destination is produced;
//! 3. otherwise the default footage rule, or `unmapped_footage` when the
//!    profile has none.
//!
//! The destination is `root / rule path / shot / stage / task / asset /
//! RESOLUTION / version / filename`, skipping absent tags.

use crate::model::{AmbiguousOption, FolderRule, TagSet};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

/// Subpath used when no rule resembles a footage rule.
pub const UNMAPPED_SUBPATH: &str = "unmapped_footage";

/// Keywords that identify the default footage rule.
pub const FOOTAGE_VOCABULARY: &[&str] = &["footage", "video", "source", "plate", "plates", "raw"];

/// Outcome of resolving one file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Full destination path including the file name; `None` iff ambiguous
    pub destination: Option<PathBuf>,
    /// Rule path that was selected, if any
    pub rule_path: Option<String>,
    pub used_default_rule: bool,
    pub ambiguous: bool,
    /// Candidates sorted by keyword; empty unless ambiguous
    pub ambiguous_options: Vec<AmbiguousOption>,
}

impl Resolution {
    /// Directory part of the destination.
    pub fn destination_dir(&self) -> Option<PathBuf> {
        self.destination
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
    }
}

/// Resolve the destination of `filename` under `root`.
pub fn resolve(root: &Path, rules: &[FolderRule], filename: &str, tags: &TagSet) -> Resolution {
    if let Some(rule) = exact_match(rules, tags) {
        return Resolution {
            destination: Some(resolve_with_rule(root, rule.path(), filename, tags)),
            rule_path: Some(rule.path().to_string()),
            used_default_rule: false,
            ambiguous: false,
            ambiguous_options: Vec::new(),
        };
    }

    let owners = keyword_owners(rules);
    let options = [tags.task.as_deref(), tags.asset.as_deref()]
        .into_iter()
        .flatten()
        .map(|token| ambiguous_options(&owners, token))
        .find(|options| !options.is_empty());
    if let Some(ambiguous_options) = options {
        return Resolution {
            destination: None,
            rule_path: None,
            used_default_rule: false,
            ambiguous: true,
            ambiguous_options,
        };
    }

    let subpath = default_rule(rules)
        .map(FolderRule::path)
        .unwrap_or(UNMAPPED_SUBPATH);
    Resolution {
        destination: Some(resolve_with_rule(root, subpath, filename, tags)),
        rule_path: Some(subpath.to_string()),
        used_default_rule: true,
        ambiguous: false,
        ambiguous_options: Vec::new(),
    }
}

/// Assemble the destination for an explicitly chosen rule path.
pub fn resolve_with_rule(root: &Path, subpath: &str, filename: &str, tags: &TagSet) -> PathBuf {
    let mut destination = root.to_path_buf();
    for part in subpath.split(['/', '\\']).map(str::trim).filter(|p| !p.is_empty()) {
        destination.push(part);
    }
    for segment in dynamic_segments(tags) {
        destination.push(segment);
    }
    destination.push(filename);
    destination
}

/// Tag-derived folders in their fixed order and casing.
pub fn dynamic_segments(tags: &TagSet) -> Vec<String> {
    let present = |tag: &Option<String>| {
        tag.as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    };
    [
        present(&tags.shot),
        present(&tags.stage).map(|s| s.to_lowercase()),
        present(&tags.task).map(|s| s.to_lowercase()),
        present(&tags.asset).map(|s| s.to_lowercase()),
        present(&tags.resolution).map(|s| s.to_uppercase()),
        present(&tags.version).map(|s| s.to_lowercase()),
    ]
    .into_iter()
    .flatten()
    .collect()
}

fn exact_match<'a>(rules: &'a [FolderRule], tags: &TagSet) -> Option<&'a FolderRule> {
    [tags.task.as_deref(), tags.asset.as_deref()]
        .into_iter()
        .flatten()
        .find_map(|token| rules.iter().find(|rule| rule.has_keyword(token)))
}

/// Every keyword mapped to the path of the first rule that lists it.
fn keyword_owners(rules: &[FolderRule]) -> BTreeMap<String, String> {
    let mut owners = BTreeMap::new();
    for rule in rules {
        for keyword in rule.normalized_keywords() {
            owners
                .entry(keyword)
                .or_insert_with(|| rule.path().to_string());
        }
    }
    owners
}

/// Keywords contained in `token`, if they belong to two or more paths.
///
/// Containment is plain substring matching, so a short keyword inside a
/// longer word (`fx` in `vfx`) counts too.
fn ambiguous_options(owners: &BTreeMap<String, String>, token: &str) -> Vec<AmbiguousOption> {
    let token = token.to_lowercase();
    let contained: Vec<AmbiguousOption> = owners
        .iter()
        .filter(|(keyword, _)| token.contains(keyword.as_str()))
        .map(|(keyword, path)| AmbiguousOption {
            keyword: keyword.clone(),
            path: path.clone(),
        })
        .collect();
    let distinct_paths: BTreeSet<&str> = contained.iter().map(|o| o.path.as_str()).collect();
    if distinct_paths.len() >= 2 {
        contained
    } else {
        Vec::new()
    }
}

/// The rule sharing the most keywords with the footage vocabulary.
fn default_rule(rules: &[FolderRule]) -> Option<&FolderRule> {
    let mut best: Option<(&FolderRule, usize)> = None;
    for rule in rules {
        let matched: HashSet<String> = rule
            .normalized_keywords()
            .filter(|k| FOOTAGE_VOCABULARY.contains(&k.as_str()))
            .collect();
        let score = matched.len();
        if score > 0 && best.map_or(true, |(_, top)| score > top) {
            best = Some((rule, score));
        }
    }
    best.map(|(rule, _)| rule)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(task: Option<&str>) -> TagSet {
        TagSet {
            task: task.map(str::to_string),
            ..TagSet::default()
        }
    }

    fn root() -> PathBuf {
        PathBuf::from("/out")
    }

    #[test]
    fn test_exact_task_match_selects_rule() {
        let rules = vec![
            FolderRule::new("renders/beauty", ["beauty"]),
            FolderRule::new("renders/fx", ["fx"]),
        ];
        let result = resolve(&root(), &rules, "SC001_fx_v001.exr", &tags(Some("FX")));
        assert!(!result.ambiguous);
        assert!(!result.used_default_rule);
        assert_eq!(result.rule_path.as_deref(), Some("renders/fx"));
        assert_eq!(
            result.destination,
            Some(PathBuf::from("/out/renders/fx/fx/SC001_fx_v001.exr"))
        );
    }

    #[test]
    fn test_asset_match_used_when_task_does_not_match() {
        let rules = vec![FolderRule::new("assets/props", ["chair"])];
        let tag_set = TagSet {
            task: Some("model".into()),
            asset: Some("Chair".into()),
            ..TagSet::default()
        };
        let result = resolve(&root(), &rules, "chair_v002.abc", &tag_set);
        assert_eq!(result.rule_path.as_deref(), Some("assets/props"));
        assert_eq!(
            result.destination,
            Some(PathBuf::from("/out/assets/props/model/chair/chair_v002.abc"))
        );
    }

    #[test]
    fn test_contained_keywords_of_different_rules_are_ambiguous() {
        let rules = vec![FolderRule::new("A", ["beauty"]), FolderRule::new("B", ["fx"])];
        let result = resolve(&root(), &rules, "SC001_beauty_fx.exr", &tags(Some("beauty_fx")));
        assert!(result.ambiguous);
        assert_eq!(result.destination, None);
        assert_eq!(result.destination_dir(), None);
        assert_eq!(
            result.ambiguous_options,
            vec![
                AmbiguousOption { keyword: "beauty".into(), path: "A".into() },
                AmbiguousOption { keyword: "fx".into(), path: "B".into() },
            ]
        );
    }

    #[test]
    fn test_contained_keywords_of_one_rule_are_not_ambiguous() {
        let rules = vec![
            FolderRule::new("A", ["beauty", "fx"]),
            FolderRule::new("plates", ["plate"]),
        ];
        let result = resolve(&root(), &rules, "x.exr", &tags(Some("beauty_fx")));
        assert!(!result.ambiguous);
        assert!(result.used_default_rule);
        assert_eq!(result.rule_path.as_deref(), Some("plates"));
    }

    #[test]
    fn test_overlapping_keyword_inside_longer_word_counts() {
        let rules = vec![FolderRule::new("vfx", ["vfx"]), FolderRule::new("fx", ["fx"])];
        let result = resolve(&root(), &rules, "x.exr", &tags(Some("vfx_pass")));
        assert!(result.ambiguous);
    }

    #[test]
    fn test_default_footage_rule_prefers_best_vocabulary_overlap() {
        let rules = vec![
            FolderRule::new("comp", ["comp"]),
            FolderRule::new("media/raw", ["raw"]),
            FolderRule::new("media/plates", ["plate", "footage", "source"]),
        ];
        let result = resolve(&root(), &rules, "clip.mov", &TagSet::default());
        assert!(result.used_default_rule);
        assert_eq!(result.destination, Some(PathBuf::from("/out/media/plates/clip.mov")));
    }

    #[test]
    fn test_unmapped_fallback_without_footage_rule() {
        let rules = vec![FolderRule::new("comp", ["comp"])];
        let result = resolve(&root(), &rules, "clip.mov", &tags(Some("lighting")));
        assert!(result.used_default_rule);
        assert_eq!(
            result.destination,
            Some(PathBuf::from("/out/unmapped_footage/lighting/clip.mov"))
        );
    }

    #[test]
    fn test_segment_order_and_casing() {
        let tag_set = TagSet {
            shot: Some("Sc010".into()),
            task: Some("Beauty".into()),
            asset: Some("HeroCar".into()),
            stage: Some("WIP".into()),
            version: Some("V003".into()),
            resolution: Some("2k".into()),
        };
        assert_eq!(
            dynamic_segments(&tag_set),
            vec!["Sc010", "wip", "beauty", "herocar", "2K", "v003"]
        );
    }

    #[test]
    fn test_blank_tags_are_skipped() {
        let tag_set = TagSet {
            shot: Some("  ".into()),
            version: Some("v001".into()),
            ..TagSet::default()
        };
        assert_eq!(dynamic_segments(&tag_set), vec!["v001"]);
    }

    #[test]
    fn test_rule_path_separators_are_normalized() {
        let dest = resolve_with_rule(&root(), r"03_renders\beauty/", "a.exr", &TagSet::default());
        assert_eq!(dest, PathBuf::from("/out/03_renders/beauty/a.exr"));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let rules = vec![FolderRule::new("A", ["beauty"]), FolderRule::new("B", ["fx"])];
        let tag_set = tags(Some("beauty"));
        let first = resolve(&root(), &rules, "SC001_beauty_v001.exr", &tag_set);
        let second = resolve(&root(), &rules, "SC001_beauty_v001.exr", &tag_set);
        assert_eq!(first, second);
    }
}
