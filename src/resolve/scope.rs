// src/resolve/scope.rs

//! Scope tree over build files.
//!
//! Every alias path from the root file produces one scope. The same file can
//! appear under several scopes (a diamond of references); its tasks then get
//! several keys, which the graph builder folds back together by identity.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{BuildFileSet, LoadedFile};
use crate::errors::SpecError;

/// How a name was reached from the scope that mentions it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DepKind {
    /// Declared in the same build file.
    BuildFile,
    /// Reached through an `[includes]` alias.
    Include,
    /// Reached through a `[references]` alias.
    Reference,
}

impl DepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepKind::BuildFile => "build-file",
            DepKind::Include => "include",
            DepKind::Reference => "reference",
        }
    }
}

pub type ScopeId = usize;

#[derive(Debug, Clone)]
pub struct Scope {
    pub id: ScopeId,
    /// Canonical path of the build file this scope reads.
    pub file: PathBuf,
    /// `alias:` chain from the root, empty at the root.
    pub prefix: String,
    /// Directory tasks of this scope run in.
    pub cwd: PathBuf,
    pub parent: Option<ScopeId>,
    pub aliases: BTreeMap<String, (ScopeId, DepKind)>,
}

impl Scope {
    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

/// What a name resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub scope: ScopeId,
    pub name: String,
    pub kind: DepKind,
}

#[derive(Debug)]
pub struct ScopeTree<'a> {
    pub files: &'a BuildFileSet,
    pub scopes: Vec<Scope>,
}

impl<'a> ScopeTree<'a> {
    /// Walk every alias from the root. An alias chain that revisits a file
    /// already on the current path is an include cycle.
    pub fn build(files: &'a BuildFileSet) -> Result<Self, SpecError> {
        let mut tree = ScopeTree {
            files,
            scopes: Vec::new(),
        };
        let root = files.root_file();
        let mut stack = vec![root.path.clone()];
        tree.add_scope(root, String::new(), root.dir.clone(), None, &mut stack)?;
        Ok(tree)
    }

    fn add_scope(
        &mut self,
        file: &'a LoadedFile,
        prefix: String,
        cwd: PathBuf,
        parent: Option<ScopeId>,
        stack: &mut Vec<PathBuf>,
    ) -> Result<ScopeId, SpecError> {
        let id = self.scopes.len();
        self.scopes.push(Scope {
            id,
            file: file.path.clone(),
            prefix: prefix.clone(),
            cwd: cwd.clone(),
            parent,
            aliases: BTreeMap::new(),
        });

        let edges = file
            .includes
            .iter()
            .map(|(alias, path)| (alias, path, DepKind::Include))
            .chain(
                file.references
                    .iter()
                    .map(|(alias, path)| (alias, path, DepKind::Reference)),
            );

        for (alias, target, kind) in edges {
            if stack.contains(target) {
                let mut path: Vec<String> =
                    stack.iter().map(|p| p.display().to_string()).collect();
                path.push(target.display().to_string());
                return Err(SpecError::Cycle {
                    kind: "includes",
                    path,
                });
            }

            let loaded = self.file(target)?;
            let child_cwd = match kind {
                DepKind::Include => cwd.clone(),
                _ => loaded.dir.clone(),
            };

            stack.push(target.clone());
            let child = self.add_scope(
                loaded,
                format!("{prefix}{alias}:"),
                child_cwd,
                Some(id),
                stack,
            )?;
            stack.pop();

            self.scopes[id].aliases.insert(alias.clone(), (child, kind));
        }

        Ok(id)
    }

    fn file(&self, path: &Path) -> Result<&'a LoadedFile, SpecError> {
        self.files.get(path).ok_or_else(|| SpecError::Load {
            path: path.display().to_string(),
            reason: "build file was not loaded".to_string(),
        })
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id]
    }

    pub fn loaded(&self, id: ScopeId) -> &'a LoadedFile {
        &self.files.files[&self.scopes[id].file]
    }

    /// Look a name up from `scope`: local definitions first, then
    /// `alias:rest` into the aliased scope.
    pub fn locate(&self, scope: ScopeId, name: &str) -> Option<Located> {
        self.locate_inner(scope, name, None)
    }

    fn locate_inner(&self, scope: ScopeId, name: &str, via: Option<DepKind>) -> Option<Located> {
        let file = &self.loaded(scope).file;
        if file.tasks.contains_key(name) || file.services.contains_key(name) {
            return Some(Located {
                scope,
                name: name.to_string(),
                kind: via.unwrap_or(DepKind::BuildFile),
            });
        }

        let (alias, rest) = name.split_once(':')?;
        let (child, kind) = self.scopes[scope].aliases.get(alias)?;
        self.locate_inner(*child, rest, Some(via.unwrap_or(*kind)))
    }
}
