// src/resolve/mod.rs

//! Reference resolution.
//!
//! Flattens the loaded build files into one namespace keyed by
//! `alias:...:name`, applies `extend`, layers environments and turns every
//! `deps`/`needs` name into a key. The result is plain data; nothing here
//! touches the filesystem or runs anything.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{CacheMode, EnvMap, Labels, TaskKey};

mod env;
mod resolver;
mod scope;

pub use env::{layer, resolve_env_values, ENV_MARKER};
pub use resolver::resolve_references;
pub use scope::{DepKind, Located, Scope, ScopeId, ScopeTree};

/// An edge to another task or service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DepLink {
    pub key: TaskKey,
    pub kind: DepKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceCommand {
    pub cmd: String,
    /// Working directory relative to the task's cwd.
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceGenerate {
    pub path: String,
    /// `None` when the build file did not say; decided from the path later.
    pub is_file: Option<bool>,
}

/// Container-only settings of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub mounts: Vec<String>,
    pub volumes: Vec<String>,
    pub ports: Vec<String>,
    pub platform: Option<String>,
}

/// Where a task runs. Chosen once here from the presence of `image`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Local,
    Container(ContainerSpec),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceTask {
    pub key: TaskKey,
    pub name: String,
    pub description: Option<String>,
    /// Build file the task was declared in.
    pub file: PathBuf,
    pub cwd: PathBuf,
    pub cmds: Vec<ReferenceCommand>,
    pub src: Vec<String>,
    pub generates: Vec<ReferenceGenerate>,
    pub envs: EnvMap,
    pub labels: Labels,
    pub cache: CacheMode,
    pub shell: String,
    pub kind: TaskKind,
    pub deps: Vec<DepLink>,
    pub needs: Vec<DepLink>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Healthcheck {
    pub cmd: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceKind {
    Container {
        image: String,
        mounts: Vec<String>,
        volumes: Vec<String>,
        healthcheck: Option<Healthcheck>,
    },
    Kubernetes {
        context: String,
        selector: Selector,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceService {
    pub key: TaskKey,
    pub name: String,
    pub description: Option<String>,
    pub cwd: PathBuf,
    pub envs: EnvMap,
    pub labels: Labels,
    pub ports: Vec<String>,
    pub kind: ServiceKind,
    pub deps: Vec<DepLink>,
    pub needs: Vec<DepLink>,
}

/// Every task and service reachable from the root build file.
#[derive(Debug, Clone, Default)]
pub struct ReferencedContext {
    pub root_dir: PathBuf,
    pub tasks: BTreeMap<TaskKey, ReferenceTask>,
    pub services: BTreeMap<TaskKey, ReferenceService>,
}

impl ReferencedContext {
    pub fn task(&self, key: &str) -> Option<&ReferenceTask> {
        self.tasks.get(key)
    }

    pub fn service(&self, key: &str) -> Option<&ReferenceService> {
        self.services.get(key)
    }

    /// Tasks declared in the root build file.
    pub fn root_tasks(&self) -> impl Iterator<Item = &ReferenceTask> {
        self.tasks.values().filter(|t| !t.key.contains(':'))
    }

    /// Tasks whose labels contain every `key = value` pair of `filter`.
    pub fn tasks_with_labels<'a>(
        &'a self,
        filter: &'a Labels,
    ) -> impl Iterator<Item = &'a ReferenceTask> + 'a {
        self.tasks.values().filter(move |t| {
            filter
                .iter()
                .all(|(k, v)| t.labels.get(k).map(|l| l == v).unwrap_or(false))
        })
    }
}
