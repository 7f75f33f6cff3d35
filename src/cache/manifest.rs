// src/cache/manifest.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::checksum::compute_file_hash;
use crate::dag::WorkNode;
use crate::errors::CacheError;
use crate::fs::FileSystem;
use crate::types::CacheMode;

/// Relative source path -> recorded value (mtime millis or content digest).
pub type Manifest = BTreeMap<String, String>;

/// Per-project directory of cache manifests, one file per node id.
///
/// Layout of a manifest file:
///
/// ```text
/// index.js=1718000000000
/// src/app.ts=1718000000123
/// ```
///
/// Written in place (not atomically). A manifest that cannot be read or
/// parsed is a cache miss, never an error for the run.
#[derive(Debug, Clone)]
pub struct CacheStore {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(fs: Arc<dyn FileSystem>, dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            dir: dir.into(),
        }
    }

    pub fn manifest_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Whether the last successful execution of `node` is still valid.
    ///
    /// Nodes without `src` are never cached.
    pub fn is_cached(&self, node: &WorkNode) -> bool {
        if node.src.is_empty() || node.cache == CacheMode::None {
            return false;
        }

        let recorded = match self.read_manifest(&node.id) {
            Ok(Some(manifest)) => manifest,
            Ok(None) => {
                debug!(task = %node.key, "no cache manifest");
                return false;
            }
            Err(err) => {
                warn!(task = %node.key, error = %err, "ignoring unreadable cache manifest");
                return false;
            }
        };

        match self.current_state(node) {
            Ok(current) => {
                let hit = current == recorded;
                debug!(task = %node.key, hit, files = current.len(), "cache check");
                hit
            }
            Err(err) => {
                warn!(task = %node.key, error = %err, "failed to stat sources; treating as miss");
                false
            }
        }
    }

    /// Rewrite the manifest from the sources as they are now.
    pub fn record_execution(&self, node: &WorkNode) -> Result<(), CacheError> {
        if node.src.is_empty() || node.cache == CacheMode::None {
            return Ok(());
        }

        let manifest = self.current_state(node)?;
        let mut contents = String::new();
        for (path, value) in &manifest {
            contents.push_str(path);
            contents.push('=');
            contents.push_str(value);
            contents.push('\n');
        }

        let path = self.manifest_path(&node.id);
        self.fs
            .write(&path, contents.as_bytes())
            .map_err(|e| CacheError::Io {
                path: path.display().to_string(),
                reason: format!("{e:#}"),
            })?;
        debug!(task = %node.key, files = manifest.len(), "recorded cache manifest");
        Ok(())
    }

    /// Drop the manifest so the next check is a miss.
    pub fn invalidate(&self, id: &str) {
        let path = self.manifest_path(id);
        if self.fs.exists(&path) {
            if let Err(err) = self.fs.remove(&path) {
                warn!(path = %path.display(), error = %err, "failed to remove cache manifest");
            }
        }
    }

    pub fn read_manifest(&self, id: &str) -> Result<Option<Manifest>, CacheError> {
        let path = self.manifest_path(id);
        if !self.fs.is_file(&path) {
            return Ok(None);
        }

        let display = path.display().to_string();
        let contents = self.fs.read_to_string(&path).map_err(|e| CacheError::Io {
            path: display.clone(),
            reason: format!("{e:#}"),
        })?;
        parse_manifest(&contents, &display).map(Some)
    }

    /// Source files of `node` with their current mtime or digest. Files
    /// under the cache directory itself are never sources.
    pub fn current_state(&self, node: &WorkNode) -> Result<Manifest, CacheError> {
        let mut manifest = Manifest::new();
        let canonical_dir = self.fs.canonicalize(&self.dir).ok();
        let in_cache_dir = |file: &Path| {
            file.starts_with(&self.dir)
                || canonical_dir.as_ref().is_some_and(|dir| file.starts_with(dir))
        };

        for matcher in &node.src {
            for file in matcher.files(self.fs.as_ref()) {
                if in_cache_dir(&file) {
                    continue;
                }
                let value = match node.cache {
                    CacheMode::Checksum => compute_file_hash(self.fs.as_ref(), &file),
                    _ => self.fs.stat(&file).map(|s| s.modified_ms.to_string()),
                }
                .map_err(|e| CacheError::Io {
                    path: file.display().to_string(),
                    reason: format!("{e:#}"),
                })?;
                manifest.insert(relative_to(&file, &node.cwd), value);
            }
        }

        Ok(manifest)
    }
}

/// `path` relative to `base` when it is below it, absolute otherwise.
fn relative_to(path: &Path, base: &Path) -> String {
    match path.strip_prefix(base) {
        Ok(rel) => rel.to_string_lossy().to_string(),
        Err(_) => path.to_string_lossy().to_string(),
    }
}

pub fn parse_manifest(contents: &str, path: &str) -> Result<Manifest, CacheError> {
    let mut manifest = Manifest::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let malformed = || CacheError::Malformed {
            path: path.to_string(),
            line: idx + 1,
        };
        let (key, value) = line.rsplit_once('=').ok_or_else(malformed)?;
        if key.is_empty() || value.is_empty() {
            return Err(malformed());
        }
        manifest.insert(key.to_string(), value.to_string());
    }
    Ok(manifest)
}
