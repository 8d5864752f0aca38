//! Filename tag extraction.
//!
//! Every tag category has an ordered list of patterns. Each pattern is
//! compiled as a case-insensitive regular expression; a pattern that does not
//! compile is used as a case-insensitive substring instead. The first pattern
//! that matches wins. Patterns are only ever matched against a file name,
//! never a full path.
//!
//! `PatternExtractor` compiles a `PatternSet` once and memoizes whole
//! `TagSet`s per `(filename, pattern-set fingerprint)` in a bounded LRU
//! `TagCache`, which may be shared across extractors built from different
//! pattern sets.

use crate::model::{PatternSet, TagSet, TaskPatterns};
use lru::LruCache;
use regex::{Regex, RegexBuilder};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

/// Which matching strategy produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchBranch {
    /// The pattern compiled as a regular expression
    Regex,
    /// The pattern did not compile and was used as a literal substring
    Substring,
}

/// A successful pattern match against a file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    /// Matched text as it appears in the file name
    pub value: String,
    pub branch: MatchBranch,
}

/// Tag categories understood by the extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagCategory {
    Shot,
    Task,
    Asset,
    Stage,
    Version,
    Resolution,
}

#[derive(Debug, Clone)]
enum CompiledPattern {
    Regex(Regex),
    Substring { pattern: String, needle: String },
}

impl CompiledPattern {
    /// Returns `None` for blank patterns, which never match.
    fn compile(pattern: &str) -> Option<Self> {
        if pattern.trim().is_empty() {
            return None;
        }
        Some(match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(regex) => CompiledPattern::Regex(regex),
            Err(_) => CompiledPattern::Substring {
                pattern: pattern.to_string(),
                needle: pattern.to_lowercase(),
            },
        })
    }

    fn branch(&self) -> MatchBranch {
        match self {
            CompiledPattern::Regex(_) => MatchBranch::Regex,
            CompiledPattern::Substring { .. } => MatchBranch::Substring,
        }
    }

    fn find(&self, file_name: &str) -> Option<PatternMatch> {
        let value = match self {
            CompiledPattern::Regex(regex) => regex
                .find(file_name)
                .map(|m| m.as_str())
                .filter(|m| !m.is_empty())
                .map(str::to_string),
            CompiledPattern::Substring { pattern, needle } => {
                find_substring(file_name, pattern, needle)
            }
        }?;
        Some(PatternMatch {
            value,
            branch: self.branch(),
        })
    }
}

/// Case-insensitive substring search returning the file name's own casing
/// when byte offsets survive lowercasing, the pattern text otherwise.
fn find_substring(file_name: &str, pattern: &str, needle: &str) -> Option<String> {
    let haystack = file_name.to_lowercase();
    let start = haystack.find(needle)?;
    let end = start + needle.len();
    if haystack.len() == file_name.len()
        && file_name.is_char_boundary(start)
        && file_name.is_char_boundary(end)
    {
        Some(file_name[start..end].to_string())
    } else {
        Some(pattern.to_string())
    }
}

/// Strip any directory components; patterns only ever see the file name.
fn file_name_only(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

fn compile_all(patterns: &[String]) -> Vec<CompiledPattern> {
    patterns
        .iter()
        .filter_map(|p| CompiledPattern::compile(p))
        .collect()
}

fn first_match(file_name: &str, patterns: &[CompiledPattern]) -> Option<PatternMatch> {
    patterns.iter().find_map(|p| p.find(file_name))
}

/// Match one pattern against a file name, reporting which branch fired.
pub fn match_pattern(filename: &str, pattern: &str) -> Option<PatternMatch> {
    CompiledPattern::compile(pattern)?.find(file_name_only(filename))
}

/// First match of `patterns` in `filename`, in list order.
pub fn extract(filename: &str, patterns: &[String]) -> Option<String> {
    first_match(file_name_only(filename), &compile_all(patterns)).map(|m| m.value)
}

/// Name of the first task category with a matching pattern.
pub fn extract_category(filename: &str, categories: &TaskPatterns) -> Option<String> {
    let file_name = file_name_only(filename);
    categories
        .iter()
        .find(|(_, patterns)| first_match(file_name, &compile_all(patterns)).is_some())
        .map(|(category, _)| category.to_string())
}

/// Fingerprint of a pattern set, used as part of the memo key. Only stable
/// within one process.
pub fn fingerprint(patterns: &PatternSet) -> u64 {
    let mut hasher = DefaultHasher::new();
    patterns.hash(&mut hasher);
    hasher.finish()
}

/// File name and pattern-set fingerprint.
pub type CacheKey = (String, u64);

/// Bounded memo of extracted tags; the least recently used entry is
/// evicted first. A capacity of 0 disables caching.
#[derive(Debug)]
pub struct TagCache {
    inner: Option<Mutex<LruCache<CacheKey, TagSet>>>,
}

impl TagCache {
    pub fn new(capacity: usize) -> Self {
        TagCache {
            inner: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, LruCache<CacheKey, TagSet>>> {
        self.inner
            .as_ref()
            .map(|cache| cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Look up and mark as recently used.
    fn get(&self, key: &CacheKey) -> Option<TagSet> {
        self.lock()?.get(key).cloned()
    }

    fn insert(&self, key: CacheKey, tags: TagSet) {
        if let Some(mut cache) = self.lock() {
            cache.put(key, tags);
        }
    }

    /// Presence check that leaves the recency order alone.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().is_some_and(|cache| cache.contains(key))
    }

    pub fn len(&self) -> usize {
        self.lock().map_or(0, |cache| cache.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Some(mut cache) = self.lock() {
            cache.clear();
        }
    }
}

/// Compiled pattern set with a read-through tag cache.
#[derive(Debug)]
pub struct PatternExtractor {
    fingerprint: u64,
    shot: Vec<CompiledPattern>,
    tasks: Vec<(String, Vec<CompiledPattern>)>,
    asset: Vec<CompiledPattern>,
    stage: Vec<CompiledPattern>,
    version: Vec<CompiledPattern>,
    resolution: Vec<CompiledPattern>,
    cache: Arc<TagCache>,
}

impl PatternExtractor {
    pub fn new(patterns: &PatternSet) -> Self {
        Self::with_cache(patterns, Arc::new(TagCache::new(4096)))
    }

    /// Build an extractor that memoizes into `cache`.
    pub fn with_cache(patterns: &PatternSet, cache: Arc<TagCache>) -> Self {
        PatternExtractor {
            fingerprint: fingerprint(patterns),
            shot: compile_all(&patterns.shot_patterns),
            tasks: patterns
                .task_patterns
                .iter()
                .map(|(category, list)| (category.to_string(), compile_all(list)))
                .collect(),
            asset: compile_all(&patterns.asset_patterns),
            stage: compile_all(&patterns.stage_patterns),
            version: compile_all(&patterns.version_patterns),
            resolution: compile_all(&patterns.resolution_patterns),
            cache,
        }
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn cache(&self) -> &Arc<TagCache> {
        &self.cache
    }

    /// Number of memoized tag sets.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Extract a single category without touching the cache.
    pub fn extract(&self, filename: &str, category: TagCategory) -> Option<String> {
        let file_name = file_name_only(filename);
        let patterns = match category {
            TagCategory::Task => {
                return self
                    .tasks
                    .iter()
                    .find(|(_, patterns)| first_match(file_name, patterns).is_some())
                    .map(|(name, _)| name.clone());
            }
            TagCategory::Shot => &self.shot,
            TagCategory::Asset => &self.asset,
            TagCategory::Stage => &self.stage,
            TagCategory::Version => &self.version,
            TagCategory::Resolution => &self.resolution,
        };
        first_match(file_name, patterns).map(|m| m.value)
    }

    /// Extract every category, memoized per file name and pattern set.
    pub fn extract_tags(&self, filename: &str) -> TagSet {
        let file_name = file_name_only(filename);
        let key = (file_name.to_string(), self.fingerprint);
        if let Some(tags) = self.cache.get(&key) {
            return tags;
        }
        let tags = TagSet {
            shot: self.extract(file_name, TagCategory::Shot),
            task: self.extract(file_name, TagCategory::Task),
            asset: self.extract(file_name, TagCategory::Asset),
            stage: self.extract(file_name, TagCategory::Stage),
            version: self.extract(file_name, TagCategory::Version),
            resolution: self.extract(file_name, TagCategory::Resolution),
        };
        self.cache.insert(key, tags.clone());
        tags
    }
}
