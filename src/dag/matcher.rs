// src/dag/matcher.rs

use std::fmt;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use tracing::warn;

use crate::errors::SpecError;
use crate::fs::{normalize_path, FileSystem};

const GLOB_CHARS: &[char] = &['*', '?', '[', '{'];

/// How a `src` entry selects files.
#[derive(Clone)]
pub enum MatcherKind {
    /// Plain path: the file itself, or everything below a directory.
    Exact,
    /// Pattern starting with a wildcard (`*.ts`, `**/*.ts`): any depth below
    /// the task directory.
    AnyDepth(GlobMatcher),
    /// Literal directory prefix followed by a pattern (`src/**/*.ts`).
    PrefixGlob(GlobMatcher),
}

/// Compiled `src` entry of a work node.
///
/// All paths are absolute. `base` is the closest directory (or file) that
/// contains every match; it is what gets scanned for cache checks and
/// subscribed to in watch mode.
#[derive(Clone)]
pub struct SourceMatcher {
    pattern: String,
    base: PathBuf,
    kind: MatcherKind,
}

impl fmt::Debug for SourceMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceMatcher")
            .field("pattern", &self.pattern)
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl SourceMatcher {
    /// Compile a `src` entry relative to `cwd`.
    pub fn new(pattern: &str, cwd: &Path) -> Result<Self, SpecError> {
        let trimmed = pattern.trim_start_matches("./");

        let Some(first_glob) = trimmed.find(GLOB_CHARS) else {
            return Ok(Self {
                pattern: pattern.to_string(),
                base: normalize_path(&cwd.join(trimmed)),
                kind: MatcherKind::Exact,
            });
        };

        if first_glob == 0 {
            let any_depth = if trimmed.starts_with("**") {
                trimmed.to_string()
            } else {
                format!("**/{trimmed}")
            };
            let base = normalize_path(cwd);
            let glob = compile(pattern, &base.join(any_depth))?;
            return Ok(Self {
                pattern: pattern.to_string(),
                base,
                kind: MatcherKind::AnyDepth(glob),
            });
        }

        // Literal part up to the last separator before the first wildcard.
        let prefix = match trimmed[..first_glob].rfind('/') {
            Some(idx) => &trimmed[..idx],
            None => "",
        };
        let base = normalize_path(&cwd.join(prefix));
        let glob = compile(pattern, &normalize_path(cwd).join(trimmed))?;
        Ok(Self {
            pattern: pattern.to_string(),
            base,
            kind: MatcherKind::PrefixGlob(glob),
        })
    }

    /// The entry as written in the build file.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn kind(&self) -> &MatcherKind {
        &self.kind
    }

    /// Whether an absolute path belongs to this source entry.
    pub fn matches(&self, path: &Path) -> bool {
        match &self.kind {
            MatcherKind::Exact => path.starts_with(&self.base),
            MatcherKind::AnyDepth(glob) | MatcherKind::PrefixGlob(glob) => {
                path.starts_with(&self.base) && glob.is_match(path)
            }
        }
    }

    /// Every existing file selected by this entry, sorted.
    pub fn files(&self, fs: &dyn FileSystem) -> Vec<PathBuf> {
        if fs.is_file(&self.base) {
            return match self.kind {
                MatcherKind::Exact => vec![self.base.clone()],
                _ if self.matches(&self.base) => vec![self.base.clone()],
                _ => Vec::new(),
            };
        }
        if !fs.is_dir(&self.base) {
            return Vec::new();
        }

        match fs.list_recursive(&self.base) {
            Ok(files) => files.into_iter().filter(|f| self.matches(f)).collect(),
            Err(err) => {
                warn!(base = %self.base.display(), error = %err, "failed to list source files");
                Vec::new()
            }
        }
    }
}

fn compile(pattern: &str, absolute: &Path) -> Result<GlobMatcher, SpecError> {
    let glob = GlobBuilder::new(&absolute.to_string_lossy())
        .literal_separator(true)
        .build()
        .map_err(|e| SpecError::InvalidTask {
            name: pattern.to_string(),
            reason: format!("invalid source pattern: {e}"),
        })?;
    Ok(glob.compile_matcher())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    #[test]
    fn exact_matches_prefix() {
        let m = SourceMatcher::new("src", Path::new("/p")).unwrap();
        assert!(matches!(m.kind(), MatcherKind::Exact));
        assert!(m.matches(Path::new("/p/src/a/b.ts")));
        assert!(!m.matches(Path::new("/p/srcs/b.ts")));
    }

    #[test]
    fn leading_wildcard_matches_any_depth() {
        let m = SourceMatcher::new("*.ts", Path::new("/p")).unwrap();
        assert!(matches!(m.kind(), MatcherKind::AnyDepth(_)));
        assert_eq!(m.base(), Path::new("/p"));
        assert!(m.matches(Path::new("/p/a.ts")));
        assert!(m.matches(Path::new("/p/deep/er/a.ts")));
        assert!(!m.matches(Path::new("/p/a.js")));
        assert!(!m.matches(Path::new("/other/a.ts")));
    }

    #[test]
    fn prefix_glob_scans_only_prefix() {
        let m = SourceMatcher::new("./src/**/*.ts", Path::new("/p")).unwrap();
        assert!(matches!(m.kind(), MatcherKind::PrefixGlob(_)));
        assert_eq!(m.base(), Path::new("/p/src"));
        assert!(m.matches(Path::new("/p/src/x/y.ts")));
        assert!(!m.matches(Path::new("/p/lib/y.ts")));
    }

    #[test]
    fn lists_matching_files() {
        let fs = MockFileSystem::new();
        fs.add_file("/p/src/a.ts", "a");
        fs.add_file("/p/src/b.js", "b");
        fs.add_file("/p/src/nested/c.ts", "c");
        fs.add_file("/p/index.js", "i");

        let globbed = SourceMatcher::new("src/**/*.ts", Path::new("/p")).unwrap();
        assert_eq!(
            globbed.files(&fs),
            vec![PathBuf::from("/p/src/a.ts"), PathBuf::from("/p/src/nested/c.ts")]
        );

        let file = SourceMatcher::new("index.js", Path::new("/p")).unwrap();
        assert_eq!(file.files(&fs), vec![PathBuf::from("/p/index.js")]);

        let missing = SourceMatcher::new("gone", Path::new("/p")).unwrap();
        assert!(missing.files(&fs).is_empty());
    }
}
