// src/fs/mod.rs

use std::fmt::Debug;
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};

pub mod mock;

/// What a path points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Other,
}

/// Subset of file metadata the cache and executor care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    /// Last modification time in milliseconds since the Unix epoch.
    pub modified_ms: u64,
}

/// Abstract filesystem interface.
pub trait FileSystem: Send + Sync + Debug {
    fn read_to_string(&self, path: &Path) -> Result<String>;
    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>>;
    fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;
    fn remove(&self, path: &Path) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn is_file(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    fn stat(&self, path: &Path) -> Result<FileStat>;
    fn canonicalize(&self, path: &Path) -> Result<PathBuf>;

    /// Return a list of entries in a directory.
    /// Returns full paths.
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Copy a single file, creating the destination's parents.
    fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        let mut contents = Vec::new();
        self.open_read(from)?
            .read_to_end(&mut contents)
            .with_context(|| format!("reading file {:?}", from))?;
        self.write(to, &contents)
    }

    /// Every file below `path`, depth first. Directories themselves are not
    /// returned.
    fn list_recursive(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut stack = vec![path.to_path_buf()];

        while let Some(dir) = stack.pop() {
            for entry in self.read_dir(&dir)? {
                if self.is_dir(&entry) {
                    stack.push(entry);
                } else if self.is_file(&entry) {
                    files.push(entry);
                }
            }
        }

        files.sort();
        Ok(files)
    }
}

/// Implementation that uses `std::fs`.
#[derive(Debug, Clone, Default)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("reading file {:?}", path))
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let file = fs::File::open(path).with_context(|| format!("opening file {:?}", path))?;
        Ok(Box::new(file))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating dir {:?}", parent))?;
        }
        let mut file = fs::File::create(path).with_context(|| format!("creating file {:?}", path))?;
        file.write_all(contents).with_context(|| format!("writing to file {:?}", path))?;
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        if path.is_dir() {
            fs::remove_dir_all(path).with_context(|| format!("removing dir {:?}", path))
        } else {
            fs::remove_file(path).with_context(|| format!("removing file {:?}", path))
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn stat(&self, path: &Path) -> Result<FileStat> {
        let meta = fs::metadata(path).with_context(|| format!("stat {:?}", path))?;
        let kind = if meta.is_file() {
            FileKind::File
        } else if meta.is_dir() {
            FileKind::Directory
        } else {
            FileKind::Other
        };
        let modified = meta
            .modified()
            .with_context(|| format!("reading mtime of {:?}", path))?;
        let modified_ms = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(FileStat { kind, modified_ms })
    }

    fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        fs::canonicalize(path).with_context(|| format!("canonicalizing {:?}", path))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).with_context(|| format!("reading dir {:?}", path))? {
            let entry = entry?;
            entries.push(entry.path());
        }
        Ok(entries)
    }
}

/// Lexically normalise a path: drop `.` components and fold `..` into the
/// parent. Does not touch the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_dots() {
        assert_eq!(
            normalize_path(Path::new("/work/./app/../lib/src")),
            PathBuf::from("/work/lib/src")
        );
        assert_eq!(normalize_path(Path::new("./")), PathBuf::from("."));
    }

    #[test]
    fn real_fs_lists_recursively_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFileSystem;
        fs.write(&dir.path().join("a/b/c.txt"), b"c").unwrap();
        fs.write(&dir.path().join("a/d.txt"), b"d").unwrap();

        let files = fs.list_recursive(&dir.path().join("a")).unwrap();
        assert_eq!(files.len(), 2);

        let stat = fs.stat(&dir.path().join("a/d.txt")).unwrap();
        assert_eq!(stat.kind, FileKind::File);
        assert!(stat.modified_ms > 0);

        fs.remove(&dir.path().join("a/b")).unwrap();
        assert!(!fs.exists(&dir.path().join("a/b/c.txt")));
    }

    #[test]
    fn copy_creates_parents() {
        let fs = mock::MockFileSystem::new();
        fs.add_file("/p/a.txt", "a");
        fs.copy(Path::new("/p/a.txt"), Path::new("/q/r/a.txt")).unwrap();
        assert_eq!(fs.read_to_string(Path::new("/q/r/a.txt")).unwrap(), "a");
        assert!(fs.is_dir(Path::new("/q/r")));
    }
}
