// src/dag/work.rs

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::dag::builder::Selection;
use crate::dag::matcher::SourceMatcher;
use crate::errors::SpecError;
use crate::resolve::{Healthcheck, Selector};
use crate::types::{CacheMode, EnvMap, Labels, NodeId, TaskKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkCommand {
    pub cmd: String,
    /// Absolute working directory of this command.
    pub cwd: PathBuf,
}

/// A build output declared with `generates`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedArtifact {
    /// Absolute path on the host.
    pub path: PathBuf,
    pub is_file: bool,
    /// Declared by a dependency rather than by the node itself.
    pub inherited: bool,
}

/// Bind mount of a host path into a container.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkMount {
    pub local: PathBuf,
    pub container: String,
}

/// Named volume mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkVolume {
    pub name: String,
    pub container: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSettings {
    pub image: String,
    /// `local:container` entries as declared (after substitution).
    pub mounts: Vec<String>,
    /// `name:container` entries as declared (after substitution).
    pub volumes: Vec<String>,
    pub ports: Vec<String>,
    pub platform: Option<String>,
    /// Directory outputs of dependencies, shared through named volumes.
    pub inherited_volumes: Vec<WorkVolume>,
    /// File outputs of dependencies, bind mounted.
    pub inherited_mounts: Vec<WorkMount>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    Local,
    Container(ContainerSettings),
}

/// Execution-ready task.
#[derive(Debug, Clone)]
pub struct WorkNode {
    pub id: NodeId,
    /// Key of the first task that produced this node.
    pub key: TaskKey,
    pub description: Option<String>,
    pub cwd: PathBuf,
    pub cmds: Vec<WorkCommand>,
    pub src: Vec<SourceMatcher>,
    pub generates: Vec<GeneratedArtifact>,
    pub envs: EnvMap,
    pub labels: Labels,
    pub cache: CacheMode,
    pub shell: String,
    pub mode: ExecutionMode,
    pub deps: Vec<NodeId>,
    pub needs: Vec<NodeId>,
}

impl WorkNode {
    /// Short id for log lines.
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    pub fn is_container(&self) -> bool {
        matches!(self.mode, ExecutionMode::Container(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceMode {
    Container {
        image: String,
        mounts: Vec<String>,
        volumes: Vec<String>,
        healthcheck: Option<Healthcheck>,
        /// Directory outputs of dependencies, as named volumes.
        inherited_volumes: Vec<WorkVolume>,
        /// File outputs of dependencies, bound from the host.
        inherited_mounts: Vec<WorkMount>,
    },
    Kubernetes {
        context: String,
        selector: Selector,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkService {
    pub id: NodeId,
    pub key: TaskKey,
    pub description: Option<String>,
    pub cwd: PathBuf,
    pub envs: EnvMap,
    pub ports: Vec<String>,
    pub mode: ServiceMode,
    pub deps: Vec<NodeId>,
    pub needs: Vec<NodeId>,
}

/// Tasks and services of one run, plus the selected roots.
///
/// Built once, then shared read-only (`Arc`) between the scheduler and the
/// executors.
#[derive(Debug, Clone, Default)]
pub struct WorkGraph {
    pub nodes: BTreeMap<NodeId, Arc<WorkNode>>,
    pub services: BTreeMap<NodeId, Arc<WorkService>>,
    /// Every task/service key that was built, mapped to its node id. Several
    /// keys map to one id when their definitions are identical.
    pub keys: BTreeMap<TaskKey, NodeId>,
    /// Tasks picked by the selection, in selection order.
    pub selected: Vec<NodeId>,
}

impl WorkGraph {
    pub fn node(&self, id: &str) -> Option<&Arc<WorkNode>> {
        self.nodes.get(id)
    }

    pub fn service(&self, id: &str) -> Option<&Arc<WorkService>> {
        self.services.get(id)
    }

    pub fn id_of(&self, key: &str) -> Option<&NodeId> {
        self.keys.get(key)
    }

    /// Task ids picked by `selection`, in selection order.
    ///
    /// `Selection::All` picks the roots the graph was built for.
    pub fn select(&self, selection: &Selection) -> Result<Vec<NodeId>, SpecError> {
        let mut ids: Vec<NodeId> = Vec::new();
        match selection {
            Selection::All => ids.extend(self.selected.iter().cloned()),
            Selection::Names(names) => {
                for name in names {
                    let id = self
                        .keys
                        .get(name)
                        .filter(|id| self.nodes.contains_key(*id))
                        .ok_or_else(|| SpecError::NotFound {
                            kind: "task",
                            name: name.clone(),
                            from: "selection".to_string(),
                        })?;
                    if !ids.contains(id) {
                        ids.push(id.clone());
                    }
                }
            }
            Selection::Labels(filter) => {
                for id in self.keys.values() {
                    let Some(node) = self.nodes.get(id) else {
                        continue;
                    };
                    let matches = filter
                        .iter()
                        .all(|(k, v)| node.labels.get(k) == Some(v));
                    if matches && !ids.contains(id) {
                        ids.push(id.clone());
                    }
                }
            }
        }
        Ok(ids)
    }

    /// Task ids with every dependency before its dependents.
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for node in self.nodes.values() {
            graph.add_node(node.id.as_str());
            for dep in &node.deps {
                graph.add_edge(dep.as_str(), node.id.as_str(), ());
            }
        }

        match toposort(&graph, None) {
            Ok(order) => order.into_iter().map(str::to_string).collect(),
            // The builder rejects cycles, so this only happens for graphs
            // assembled by hand.
            Err(_) => self.nodes.keys().cloned().collect(),
        }
    }

    /// Human readable listing used by `--dry-run`.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let key_of = |id: &NodeId| -> String {
            self.nodes
                .get(id)
                .map(|n| n.key.clone())
                .or_else(|| self.services.get(id).map(|s| s.key.clone()))
                .unwrap_or_else(|| id.clone())
        };

        let _ = writeln!(out, "tasks ({}):", self.nodes.len());
        for id in self.topological_order() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            let mode = match &node.mode {
                ExecutionMode::Local => "local".to_string(),
                ExecutionMode::Container(c) => format!("container {}", c.image),
            };
            let marker = if self.selected.contains(&id) { "*" } else { "-" };
            let _ = writeln!(out, "  {marker} {} [{mode}] {}", node.key, node.short_id());
            for cmd in &node.cmds {
                let _ = writeln!(out, "      cmd: {}", cmd.cmd);
            }
            if !node.deps.is_empty() {
                let deps: Vec<String> = node.deps.iter().map(key_of).collect();
                let _ = writeln!(out, "      deps: {}", deps.join(", "));
            }
            if !node.needs.is_empty() {
                let needs: Vec<String> = node.needs.iter().map(key_of).collect();
                let _ = writeln!(out, "      needs: {}", needs.join(", "));
            }
            if !node.src.is_empty() {
                let src: Vec<&str> = node.src.iter().map(|s| s.pattern()).collect();
                let _ = writeln!(out, "      src: {}", src.join(", "));
            }
        }

        if !self.services.is_empty() {
            let _ = writeln!(out, "services ({}):", self.services.len());
            for service in self.services.values() {
                let mode = match &service.mode {
                    ServiceMode::Container { image, .. } => format!("container {image}"),
                    ServiceMode::Kubernetes { context, selector } => {
                        format!("kubernetes {context} {}/{}", selector.kind, selector.name)
                    }
                };
                let _ = writeln!(
                    out,
                    "  - {} [{mode}] {}",
                    service.key,
                    &service.id[..service.id.len().min(12)]
                );
            }
        }

        out
    }
}
