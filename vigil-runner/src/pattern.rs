// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Glob and path-segment matching.
//!
//! Used by the watcher for ignore rules and by the watch loop for
//! include/exclude filtering. Matching never fails: malformed glob syntax is
//! a non-match, and the same path/pattern pair always yields the same
//! answer.

use camino::Utf8Path;
use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};

/// Returns true if `path` matches any of `patterns`.
pub fn matches_any(path: &Utf8Path, patterns: &[String]) -> bool {
    patterns.iter().any(|p| matches_pattern(path, p))
}

/// Returns true if `path` matches `pattern`.
///
/// A pattern containing wildcards is matched as a glob, with `*` confined to
/// one path segment and `**` crossing segments. A pattern without wildcards
/// is matched against each path segment, so a bare directory name like
/// `.git` matches anywhere in the path. Malformed glob syntax is a
/// non-match.
pub fn matches_pattern(path: &Utf8Path, pattern: &str) -> bool {
    if !has_glob_meta(pattern) {
        return matches_segment(path, pattern);
    }
    match compile(pattern) {
        Some(matcher) => matcher.is_match(path.as_std_path()),
        None => false,
    }
}

/// A pre-compiled set of patterns.
///
/// Splits patterns into a glob set and a list of literal segments at
/// construction, so per-event matching does not recompile. Malformed
/// patterns are dropped, matching the non-match rule of
/// [`matches_pattern`].
#[derive(Clone, Debug, Default)]
pub struct PatternSet {
    globs: GlobSet,
    literals: Vec<String>,
    // Wildcard-free segments of glob patterns, e.g. "vendor" out of
    // "**/vendor/**". Used only for directory matching.
    glob_segments: Vec<String>,
}

impl PatternSet {
    /// Compiles `patterns` into a set.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        let mut literals = Vec::new();
        let mut glob_segments = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if !has_glob_meta(pattern) {
                literals.push(pattern.to_owned());
                continue;
            }
            if let Ok(glob) = GlobBuilder::new(pattern).literal_separator(true).build() {
                builder.add(glob);
                glob_segments.extend(
                    pattern
                        .split('/')
                        .filter(|seg| !seg.is_empty() && !has_glob_meta(seg))
                        .map(str::to_owned),
                );
            }
        }
        // A builder over valid globs cannot fail to build.
        let globs = builder.build().unwrap_or_else(|_| GlobSet::empty());
        Self {
            globs,
            literals,
            glob_segments,
        }
    }

    /// Returns true if `path` matches any pattern in the set.
    pub fn matches_path(&self, path: &Utf8Path) -> bool {
        if self.globs.is_match(path.as_std_path()) {
            return true;
        }
        self.literals.iter().any(|l| matches_segment(path, l))
    }

    /// Returns true if a directory at `dir` falls under this set for
    /// watch-registration purposes.
    ///
    /// This is broader than [`matches_path`](Self::matches_path): a pattern
    /// like `**/vendor/**` names the contents of `vendor`, but the watcher
    /// must skip registering `vendor` itself. Any literal segment inside a
    /// glob pattern therefore also excludes directories of that name.
    pub fn matches_dir(&self, dir: &Utf8Path) -> bool {
        if self.matches_path(dir) {
            return true;
        }
        dir.components()
            .any(|c| self.glob_segments.iter().any(|seg| seg == c.as_str()))
    }

    /// Returns true if the set contains no patterns.
    pub fn is_empty(&self) -> bool {
        self.globs.is_empty() && self.literals.is_empty()
    }
}

fn has_glob_meta(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

fn matches_segment(path: &Utf8Path, name: &str) -> bool {
    path.components().any(|c| c.as_str() == name)
}

fn compile(pattern: &str) -> Option<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .ok()
        .map(|glob| glob.compile_matcher())
}
