// src/dag/builder.rs

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::cache::identity::{node_identity, service_identity, sha1_hex};
use crate::dag::matcher::SourceMatcher;
use crate::dag::template::substitute;
use crate::dag::work::{
    ContainerSettings, ExecutionMode, GeneratedArtifact, ServiceMode, WorkCommand, WorkGraph,
    WorkMount, WorkNode, WorkService, WorkVolume,
};
use crate::errors::SpecError;
use crate::fs::normalize_path;
use crate::resolve::{ReferenceTask, ReferencedContext, ServiceKind, TaskKind};
use crate::types::{Labels, NodeId, TaskKey};

/// Which tasks a run starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every task of the root build file.
    All,
    /// Exact task keys.
    Names(Vec<TaskKey>),
    /// Tasks carrying every `key = value` pair.
    Labels(Labels),
}

/// Prefix of the named volume that carries a directory artifact between
/// container tasks.
pub const VOLUME_PREFIX: &str = "taskrig-";

/// Name of the volume shared for a generated directory.
pub fn volume_name(path: &Path) -> String {
    format!("{VOLUME_PREFIX}{}", sha1_hex(path.to_string_lossy().as_bytes()))
}

/// Build the work graph for `selection`, pulling in every dependency and
/// needed service.
pub fn build_work_graph(
    ctx: &ReferencedContext,
    selection: &Selection,
) -> Result<WorkGraph, SpecError> {
    let mut builder = GraphBuilder {
        ctx,
        graph: WorkGraph::default(),
        visiting: Vec::new(),
    };

    let roots: Vec<TaskKey> = match selection {
        Selection::All => ctx.root_tasks().map(|t| t.key.clone()).collect(),
        Selection::Names(names) => names.clone(),
        Selection::Labels(filter) => ctx.tasks_with_labels(filter).map(|t| t.key.clone()).collect(),
    };

    for key in roots {
        if ctx.task(&key).is_none() {
            return Err(SpecError::NotFound {
                kind: "task",
                name: key,
                from: "selection".to_string(),
            });
        }
        let id = builder.task(&key)?;
        if !builder.graph.selected.contains(&id) {
            builder.graph.selected.push(id);
        }
    }

    debug!(
        nodes = builder.graph.nodes.len(),
        services = builder.graph.services.len(),
        selected = builder.graph.selected.len(),
        "built work graph"
    );
    Ok(builder.graph)
}

struct GraphBuilder<'c> {
    ctx: &'c ReferencedContext,
    graph: WorkGraph,
    /// Keys on the current build path.
    visiting: Vec<TaskKey>,
}

impl<'c> GraphBuilder<'c> {
    fn enter(&mut self, key: &str) -> Result<(), SpecError> {
        if let Some(pos) = self.visiting.iter().position(|k| k == key) {
            let mut path = self.visiting[pos..].to_vec();
            path.push(key.to_string());
            return Err(SpecError::Cycle { kind: "deps", path });
        }
        self.visiting.push(key.to_string());
        Ok(())
    }

    fn task(&mut self, key: &str) -> Result<NodeId, SpecError> {
        if let Some(id) = self.graph.keys.get(key) {
            return Ok(id.clone());
        }

        let r = self.ctx.task(key).ok_or_else(|| SpecError::NotFound {
            kind: "task",
            name: key.to_string(),
            from: self.visiting.last().cloned().unwrap_or_default(),
        })?;

        self.enter(key)?;
        let deps = r
            .deps
            .iter()
            .map(|d| self.task(&d.key))
            .collect::<Result<Vec<_>, _>>()?;
        let needs = r
            .needs
            .iter()
            .map(|n| self.service(&n.key))
            .collect::<Result<Vec<_>, _>>()?;
        self.visiting.pop();

        let mut node = self.work_node(r, deps, needs)?;
        node.id = node_identity(&node).map_err(|e| SpecError::InvalidTask {
            name: key.to_string(),
            reason: format!("cannot compute identity: {e}"),
        })?;

        let id = node.id.clone();
        if self.graph.nodes.contains_key(&id) {
            debug!(task = %key, id = %id, "task shares identity with an existing node");
        } else {
            self.graph.nodes.insert(id.clone(), Arc::new(node));
        }
        self.graph.keys.insert(key.to_string(), id.clone());
        Ok(id)
    }

    fn work_node(
        &self,
        r: &ReferenceTask,
        deps: Vec<NodeId>,
        needs: Vec<NodeId>,
    ) -> Result<WorkNode, SpecError> {
        let env = &r.envs;
        let cwd = r.cwd.clone();

        let cmds = r
            .cmds
            .iter()
            .map(|c| WorkCommand {
                cmd: substitute(&c.cmd, env),
                cwd: match &c.path {
                    Some(path) => normalize_path(&cwd.join(substitute(path, env))),
                    None => cwd.clone(),
                },
            })
            .collect();

        let src = r
            .src
            .iter()
            .map(|s| SourceMatcher::new(&substitute(s, env), &cwd))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SpecError::InvalidTask {
                name: r.key.clone(),
                reason: e.to_string(),
            })?;

        let mut generates: Vec<GeneratedArtifact> = r
            .generates
            .iter()
            .map(|g| {
                let raw = substitute(&g.path, env);
                let path = normalize_path(&cwd.join(&raw));
                GeneratedArtifact {
                    is_file: g.is_file.unwrap_or_else(|| looks_like_file(&path)),
                    path,
                    inherited: false,
                }
            })
            .collect();

        for artifact in self.dependency_outputs(&deps) {
            if !generates.iter().any(|g| g.path == artifact.path) {
                generates.push(artifact);
            }
        }

        let mode = match &r.kind {
            TaskKind::Local => ExecutionMode::Local,
            TaskKind::Container(spec) => {
                let (inherited_volumes, inherited_mounts) =
                    inherited_bindings(generates.iter().filter(|g| g.inherited));

                ExecutionMode::Container(ContainerSettings {
                    image: substitute(&spec.image, env),
                    mounts: spec.mounts.iter().map(|m| substitute(m, env)).collect(),
                    volumes: spec.volumes.iter().map(|v| substitute(v, env)).collect(),
                    ports: spec.ports.iter().map(|p| substitute(p, env)).collect(),
                    platform: spec.platform.clone(),
                    inherited_volumes,
                    inherited_mounts,
                })
            }
        };

        Ok(WorkNode {
            id: NodeId::new(),
            key: r.key.clone(),
            description: r.description.clone(),
            cwd,
            cmds,
            src,
            generates,
            envs: r.envs.clone(),
            labels: r.labels.clone(),
            cache: r.cache,
            shell: r.shell.clone(),
            mode,
            deps,
            needs,
        })
    }

    /// Outputs of `deps`, transitively: each dependency already carries
    /// what it inherited. Marked as inherited, first path wins.
    fn dependency_outputs(&self, deps: &[NodeId]) -> Vec<GeneratedArtifact> {
        let mut outputs: Vec<GeneratedArtifact> = Vec::new();
        for dep in deps {
            let Some(dep_node) = self.graph.nodes.get(dep) else {
                continue;
            };
            for artifact in &dep_node.generates {
                if !outputs.iter().any(|g| g.path == artifact.path) {
                    outputs.push(GeneratedArtifact {
                        inherited: true,
                        ..artifact.clone()
                    });
                }
            }
        }
        outputs
    }

    fn service(&mut self, key: &str) -> Result<NodeId, SpecError> {
        if let Some(id) = self.graph.keys.get(key) {
            return Ok(id.clone());
        }

        let r = self.ctx.service(key).ok_or_else(|| SpecError::NotFound {
            kind: "service",
            name: key.to_string(),
            from: self.visiting.last().cloned().unwrap_or_default(),
        })?;

        self.enter(key)?;
        let deps = r
            .deps
            .iter()
            .map(|d| self.task(&d.key))
            .collect::<Result<Vec<_>, _>>()?;
        let needs = r
            .needs
            .iter()
            .map(|n| self.service(&n.key))
            .collect::<Result<Vec<_>, _>>()?;
        self.visiting.pop();

        let env = &r.envs;
        let mode = match &r.kind {
            ServiceKind::Container {
                image,
                mounts,
                volumes,
                healthcheck,
            } => {
                let outputs = self.dependency_outputs(&deps);
                let (inherited_volumes, inherited_mounts) = inherited_bindings(outputs.iter());
                ServiceMode::Container {
                    image: substitute(image, env),
                    mounts: mounts.iter().map(|m| substitute(m, env)).collect(),
                    volumes: volumes.iter().map(|v| substitute(v, env)).collect(),
                    healthcheck: healthcheck.clone(),
                    inherited_volumes,
                    inherited_mounts,
                }
            }
            ServiceKind::Kubernetes { context, selector } => ServiceMode::Kubernetes {
                context: substitute(context, env),
                selector: selector.clone(),
            },
        };

        let mut service = WorkService {
            id: NodeId::new(),
            key: r.key.clone(),
            description: r.description.clone(),
            cwd: r.cwd.clone(),
            envs: r.envs.clone(),
            ports: r.ports.iter().map(|p| substitute(p, env)).collect(),
            mode,
            deps,
            needs,
        };
        service.id = service_identity(&service).map_err(|e| SpecError::InvalidTask {
            name: key.to_string(),
            reason: format!("cannot compute identity: {e}"),
        })?;

        let id = service.id.clone();
        self.graph
            .services
            .entry(id.clone())
            .or_insert_with(|| Arc::new(service));
        self.graph.keys.insert(key.to_string(), id.clone());
        Ok(id)
    }
}

/// Inherited outputs as container bindings: directories travel through
/// their named volume, files are bound from the host.
fn inherited_bindings<'a>(
    artifacts: impl Iterator<Item = &'a GeneratedArtifact>,
) -> (Vec<WorkVolume>, Vec<WorkMount>) {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    for artifact in artifacts {
        let container = artifact.path.to_string_lossy().to_string();
        if artifact.is_file {
            mounts.push(WorkMount {
                local: artifact.path.clone(),
                container,
            });
        } else {
            volumes.push(WorkVolume {
                name: volume_name(&artifact.path),
                container,
            });
        }
    }
    (volumes, mounts)
}

/// A generated path without a declared kind is a file when its last
/// component has an extension (`report.json`), a directory otherwise
/// (`dist`, `node_modules`).
fn looks_like_file(path: &Path) -> bool {
    path.extension().is_some()
}
