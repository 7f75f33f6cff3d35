// src/config/loader.rs

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::BuildFile;
use crate::config::validate::validate_build_file;
use crate::errors::SpecError;
use crate::fs::{normalize_path, FileSystem};

/// Default build file name looked up in the working directory.
pub const DEFAULT_BUILD_FILE: &str = "taskrig.toml";

/// A parsed build file plus its resolved alias targets.
#[derive(Debug, Clone)]
pub struct LoadedFile {
    /// Canonical path of the file itself.
    pub path: PathBuf,
    /// Directory containing the file.
    pub dir: PathBuf,
    pub file: BuildFile,
    /// Alias -> canonical path of the included file.
    pub includes: BTreeMap<String, PathBuf>,
    /// Alias -> canonical path of the referenced file.
    pub references: BTreeMap<String, PathBuf>,
}

/// Every build file reachable from the root, each loaded exactly once.
///
/// Files are addressed by canonical path; alias edges between them are stored
/// as paths, never as nested values, so include cycles are representable and
/// rejected later by the resolver.
#[derive(Debug, Clone)]
pub struct BuildFileSet {
    pub root: PathBuf,
    pub files: BTreeMap<PathBuf, LoadedFile>,
}

impl BuildFileSet {
    pub fn root_file(&self) -> &LoadedFile {
        &self.files[&self.root]
    }

    pub fn get(&self, path: &Path) -> Option<&LoadedFile> {
        self.files.get(path)
    }
}

/// Parse a single build file from TOML text.
pub fn parse_build_file(path: &Path, contents: &str) -> Result<BuildFile, SpecError> {
    let file: BuildFile = toml::from_str(contents).map_err(|e| SpecError::Load {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    validate_build_file(path, &file)?;
    Ok(file)
}

/// Load the root build file and every file it transitively includes or
/// references.
pub fn load_build_files(fs: &dyn FileSystem, root: &Path) -> Result<BuildFileSet, SpecError> {
    let root = locate(fs, root, root)?;
    let mut files = BTreeMap::new();
    let mut queue = VecDeque::from([root.clone()]);

    while let Some(path) = queue.pop_front() {
        if files.contains_key(&path) {
            continue;
        }

        debug!(path = %path.display(), "loading build file");
        let contents = fs.read_to_string(&path).map_err(|e| SpecError::Load {
            path: path.display().to_string(),
            reason: format!("{e:#}"),
        })?;
        let file = parse_build_file(&path, &contents)?;

        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        let mut includes = BTreeMap::new();
        for (alias, rel) in &file.includes {
            let target = locate(fs, &dir.join(rel), &path)?;
            queue.push_back(target.clone());
            includes.insert(alias.clone(), target);
        }

        let mut references = BTreeMap::new();
        for (alias, rel) in &file.references {
            let target = locate(fs, &dir.join(rel), &path)?;
            queue.push_back(target.clone());
            references.insert(alias.clone(), target);
        }

        files.insert(
            path.clone(),
            LoadedFile {
                path,
                dir,
                file,
                includes,
                references,
            },
        );
    }

    Ok(BuildFileSet { root, files })
}

/// Resolve a path to a build file. A directory resolves to the default file
/// name inside it.
fn locate(fs: &dyn FileSystem, candidate: &Path, from: &Path) -> Result<PathBuf, SpecError> {
    let mut path = normalize_path(candidate);
    if fs.is_dir(&path) {
        path = path.join(DEFAULT_BUILD_FILE);
    }
    if !fs.is_file(&path) {
        return Err(SpecError::Load {
            path: path.display().to_string(),
            reason: format!("build file not found (referenced from {})", from.display()),
        });
    }
    fs.canonicalize(&path).map_err(|e| SpecError::Load {
        path: path.display().to_string(),
        reason: format!("{e:#}"),
    })
}
