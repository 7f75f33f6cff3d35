// src/resolve/resolver.rs

use std::collections::HashMap;
use std::time::Duration;

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::config::{parse_duration, BuildFileSet, ServiceConfig, TaskConfig};
use crate::errors::SpecError;
use crate::types::{CacheMode, EnvMap, Labels, TaskKey};

use super::env::{layer, resolve_env_values};
use super::scope::{DepKind, ScopeId, ScopeTree};
use super::{
    ContainerSpec, DepLink, Healthcheck, ReferenceCommand, ReferenceGenerate, ReferenceService,
    ReferenceTask, ReferencedContext, Selector, ServiceKind, TaskKind,
};

const DEFAULT_SHELL: &str = "sh";
const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolve every task and service reachable from the root build file.
///
/// `process_env` supplies values for `$NAME` environment entries.
pub fn resolve_references(
    files: &BuildFileSet,
    process_env: &EnvMap,
) -> Result<ReferencedContext, SpecError> {
    let tree = ScopeTree::build(files)?;
    let mut resolver = Resolver {
        tree: &tree,
        process_env,
        scope_envs: Vec::with_capacity(tree.scopes.len()),
        merged: HashMap::new(),
    };
    resolver.resolve_scope_envs()?;

    let mut ctx = ReferencedContext {
        root_dir: files.root_file().dir.clone(),
        ..Default::default()
    };

    for scope in &tree.scopes {
        let file = &tree.loaded(scope.id).file;

        for name in file.tasks.keys() {
            let task = resolver.task(scope.id, name)?;
            ctx.tasks.insert(task.key.clone(), task);
        }

        for (name, config) in &file.services {
            let service = resolver.service(scope.id, name, config)?;
            ctx.services.insert(service.key.clone(), service);
        }
    }

    check_acyclic(&ctx)?;

    debug!(
        tasks = ctx.tasks.len(),
        services = ctx.services.len(),
        scopes = tree.scopes.len(),
        "resolved build files"
    );
    Ok(ctx)
}

/// A task definition after `extend` was applied, with names already
/// turned into keys.
#[derive(Debug, Clone, Default)]
struct MergedTask {
    description: Option<String>,
    image: Option<String>,
    shell: Option<String>,
    cmds: Vec<ReferenceCommand>,
    src: Vec<String>,
    generates: Vec<ReferenceGenerate>,
    deps: Vec<DepLink>,
    needs: Vec<DepLink>,
    labels: Labels,
    cache: Option<CacheMode>,
    mounts: Vec<String>,
    volumes: Vec<String>,
    ports: Vec<String>,
    platform: Option<String>,
    envs: EnvMap,
}

impl MergedTask {
    /// Base entries first; the extending task wins wherever a single value
    /// is expected.
    fn extend_from(self, base: MergedTask) -> MergedTask {
        MergedTask {
            description: self.description.or(base.description),
            image: self.image.or(base.image),
            shell: self.shell.or(base.shell),
            cmds: concat(base.cmds, self.cmds),
            src: concat_unique(base.src, self.src),
            generates: concat_unique(base.generates, self.generates),
            deps: concat_unique(base.deps, self.deps),
            needs: concat_unique(base.needs, self.needs),
            labels: layer(&[&base.labels, &self.labels]),
            cache: self.cache.or(base.cache),
            mounts: prefer_own(self.mounts, base.mounts),
            volumes: prefer_own(self.volumes, base.volumes),
            ports: prefer_own(self.ports, base.ports),
            platform: self.platform.or(base.platform),
            envs: layer(&[&base.envs, &self.envs]),
        }
    }
}

fn concat<T>(mut base: Vec<T>, own: Vec<T>) -> Vec<T> {
    base.extend(own);
    base
}

fn concat_unique<T: PartialEq>(mut base: Vec<T>, own: Vec<T>) -> Vec<T> {
    for item in own {
        if !base.contains(&item) {
            base.push(item);
        }
    }
    base
}

fn prefer_own<T>(own: Vec<T>, base: Vec<T>) -> Vec<T> {
    if own.is_empty() { base } else { own }
}

struct Resolver<'t, 'a> {
    tree: &'t ScopeTree<'a>,
    process_env: &'t EnvMap,
    /// Build-file environment per scope, indexed by scope id.
    scope_envs: Vec<EnvMap>,
    merged: HashMap<TaskKey, MergedTask>,
}

impl<'t, 'a> Resolver<'t, 'a> {
    /// Included scopes see the includer's environment under their own;
    /// referenced scopes only see their own file's.
    fn resolve_scope_envs(&mut self) -> Result<(), SpecError> {
        let tree = self.tree;
        for scope in &tree.scopes {
            let loaded = tree.loaded(scope.id);
            let own = resolve_env_values(
                &loaded.file.envs,
                self.process_env,
                &loaded.path.display().to_string(),
            )?;

            let inherited = scope.parent.and_then(|parent| {
                let included = tree.scope(parent).aliases.values().any(|(child, kind)| {
                    *child == scope.id && *kind == DepKind::Include
                });
                included.then(|| &self.scope_envs[parent])
            });

            let env = match inherited {
                Some(parent_env) => layer(&[parent_env, &own]),
                None => own,
            };
            self.scope_envs.push(env);
        }
        Ok(())
    }

    fn task(&mut self, scope: ScopeId, name: &str) -> Result<ReferenceTask, SpecError> {
        let mut stack = Vec::new();
        let merged = self.merge(scope, name, &mut stack)?;
        let s = self.tree.scope(scope);
        let key = s.key(name);

        let kind = match merged.image {
            Some(image) => TaskKind::Container(ContainerSpec {
                image,
                mounts: merged.mounts,
                volumes: merged.volumes,
                ports: merged.ports,
                platform: merged.platform,
            }),
            None => {
                if !merged.mounts.is_empty()
                    || !merged.volumes.is_empty()
                    || merged.platform.is_some()
                {
                    return Err(SpecError::InvalidTask {
                        name: key,
                        reason: "`mounts`, `volumes` and `platform` require `image`".to_string(),
                    });
                }
                TaskKind::Local
            }
        };

        if merged.cmds.is_empty() && merged.deps.is_empty() {
            return Err(SpecError::InvalidTask {
                name: key,
                reason: "task has neither commands nor dependencies".to_string(),
            });
        }

        Ok(ReferenceTask {
            key,
            name: name.to_string(),
            description: merged.description,
            file: s.file.clone(),
            cwd: s.cwd.clone(),
            cmds: merged.cmds,
            src: merged.src,
            generates: merged.generates,
            envs: merged.envs,
            labels: merged.labels,
            cache: merged.cache.unwrap_or_default(),
            shell: merged.shell.unwrap_or_else(|| DEFAULT_SHELL.to_string()),
            kind,
            deps: merged.deps,
            needs: merged.needs,
        })
    }

    /// Apply `extend` recursively. `stack` holds the keys currently being
    /// merged; meeting one again is an extend cycle.
    fn merge(
        &mut self,
        scope: ScopeId,
        name: &str,
        stack: &mut Vec<TaskKey>,
    ) -> Result<MergedTask, SpecError> {
        let key = self.tree.scope(scope).key(name);

        if let Some(pos) = stack.iter().position(|k| *k == key) {
            let mut path = stack[pos..].to_vec();
            path.push(key);
            return Err(SpecError::Cycle {
                kind: "extend",
                path,
            });
        }
        if let Some(done) = self.merged.get(&key) {
            return Ok(done.clone());
        }

        let config = self.task_config(scope, name, &key)?;
        let own = self.own_fields(scope, &key, config)?;

        let merged = match &config.extend {
            Some(base_name) => {
                let base = self
                    .tree
                    .locate(scope, base_name)
                    .filter(|loc| self.tree.loaded(loc.scope).file.tasks.contains_key(&loc.name))
                    .ok_or_else(|| SpecError::NotFound {
                        kind: "task",
                        name: base_name.clone(),
                        from: format!("extend of {key}"),
                    })?;

                stack.push(key.clone());
                let base = self.merge(base.scope, &base.name, stack)?;
                stack.pop();
                own.extend_from(base)
            }
            None => own,
        };

        self.merged.insert(key, merged.clone());
        Ok(merged)
    }

    fn task_config(&self, scope: ScopeId, name: &str, key: &str) -> Result<&'a TaskConfig, SpecError> {
        self.tree
            .loaded(scope)
            .file
            .tasks
            .get(name)
            .ok_or_else(|| SpecError::NotFound {
                kind: "task",
                name: key.to_string(),
                from: self.tree.scope(scope).file.display().to_string(),
            })
    }

    fn own_fields(
        &self,
        scope: ScopeId,
        key: &str,
        config: &TaskConfig,
    ) -> Result<MergedTask, SpecError> {
        let from = format!("task {key}");
        let task_env = resolve_env_values(&config.envs, self.process_env, &from)?;

        let deps = config
            .deps
            .iter()
            .map(|d| self.link_task(scope, d, key))
            .collect::<Result<Vec<_>, _>>()?;
        let needs = config
            .needs
            .iter()
            .map(|n| self.link_service(scope, n, key))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MergedTask {
            description: config.description.clone(),
            image: config.image.clone(),
            shell: config.shell.clone(),
            cmds: config
                .cmds
                .iter()
                .map(|c| ReferenceCommand {
                    cmd: c.cmd().to_string(),
                    path: c.path().map(str::to_string),
                })
                .collect(),
            src: config.src.clone(),
            generates: config
                .generates
                .iter()
                .map(|g| ReferenceGenerate {
                    path: g.path().to_string(),
                    is_file: g.is_file(),
                })
                .collect(),
            deps,
            needs,
            labels: config.labels.clone(),
            cache: config.cache,
            mounts: config.mounts.clone(),
            volumes: config.volumes.clone(),
            ports: config.ports.clone(),
            platform: config.platform.clone(),
            envs: layer(&[&self.scope_envs[scope], &task_env]),
        })
    }

    fn link_task(&self, scope: ScopeId, name: &str, from: &str) -> Result<DepLink, SpecError> {
        let loc = self
            .tree
            .locate(scope, name)
            .ok_or_else(|| SpecError::NotFound {
                kind: "task",
                name: name.to_string(),
                from: from.to_string(),
            })?;

        if !self.tree.loaded(loc.scope).file.tasks.contains_key(&loc.name) {
            return Err(SpecError::InvalidTask {
                name: from.to_string(),
                reason: format!("'{name}' in deps is a service; use needs"),
            });
        }

        Ok(DepLink {
            key: self.tree.scope(loc.scope).key(&loc.name),
            kind: loc.kind,
        })
    }

    fn link_service(&self, scope: ScopeId, name: &str, from: &str) -> Result<DepLink, SpecError> {
        let loc = self
            .tree
            .locate(scope, name)
            .ok_or_else(|| SpecError::NotFound {
                kind: "service",
                name: name.to_string(),
                from: from.to_string(),
            })?;

        if self.tree.loaded(loc.scope).file.tasks.contains_key(&loc.name) {
            return Err(SpecError::NeedsTask {
                name: name.to_string(),
                from: from.to_string(),
            });
        }

        Ok(DepLink {
            key: self.tree.scope(loc.scope).key(&loc.name),
            kind: loc.kind,
        })
    }

    fn service(
        &self,
        scope: ScopeId,
        name: &str,
        config: &ServiceConfig,
    ) -> Result<ReferenceService, SpecError> {
        let s = self.tree.scope(scope);
        let key = s.key(name);
        let from = format!("service {key}");
        let own_env = resolve_env_values(&config.envs, self.process_env, &from)?;

        let invalid = |reason: String| SpecError::InvalidTask {
            name: key.clone(),
            reason,
        };

        let kind = match (&config.image, &config.context, &config.selector) {
            (Some(image), None, _) => {
                let healthcheck = match &config.healthcheck {
                    Some(check) => Some(Healthcheck {
                        cmd: check.cmd.clone(),
                        interval: duration_or(&check.interval, DEFAULT_HEALTH_INTERVAL)
                            .map_err(&invalid)?,
                        timeout: duration_or(&check.timeout, DEFAULT_HEALTH_TIMEOUT)
                            .map_err(&invalid)?,
                        retries: check.retries,
                    }),
                    None => None,
                };
                ServiceKind::Container {
                    image: image.clone(),
                    mounts: config.mounts.clone(),
                    volumes: config.volumes.clone(),
                    healthcheck,
                }
            }
            (None, Some(context), Some(selector)) => ServiceKind::Kubernetes {
                context: context.clone(),
                selector: Selector {
                    kind: selector.kind.clone(),
                    name: selector.name.clone(),
                },
            },
            _ => {
                return Err(invalid(
                    "service needs either `image` or `context` with `selector`".to_string(),
                ));
            }
        };

        let deps = config
            .deps
            .iter()
            .map(|d| self.link_task(scope, d, &key))
            .collect::<Result<Vec<_>, _>>()?;
        let needs = config
            .needs
            .iter()
            .map(|n| self.link_service(scope, n, &key))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ReferenceService {
            key: key.clone(),
            name: name.to_string(),
            description: config.description.clone(),
            cwd: s.cwd.clone(),
            envs: layer(&[&self.scope_envs[scope], &own_env]),
            labels: config.labels.clone(),
            ports: config.ports.clone(),
            kind,
            deps,
            needs,
        })
    }
}

fn duration_or(value: &Option<String>, default: Duration) -> Result<Duration, String> {
    match value {
        Some(v) => parse_duration(v).map_err(|e| format!("healthcheck: {e}")),
        None => Ok(default),
    }
}

/// `deps` and `needs` together must form a DAG, otherwise some node would
/// wait on itself forever.
fn check_acyclic(ctx: &ReferencedContext) -> Result<(), SpecError> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    let edges = ctx
        .tasks
        .values()
        .map(|t| (t.key.as_str(), t.deps.iter().chain(t.needs.iter())))
        .chain(
            ctx.services
                .values()
                .map(|s| (s.key.as_str(), s.deps.iter().chain(s.needs.iter()))),
        );

    for (key, links) in edges {
        graph.add_node(key);
        for link in links {
            graph.add_edge(link.key.as_str(), key, ());
        }
    }

    match toposort(&graph, None) {
        Ok(_) => Ok(()),
        Err(cycle) => {
            let start = cycle.node_id();
            let mut path: Vec<String> = tarjan_scc(&graph)
                .into_iter()
                .find(|component| component.contains(&start))
                .unwrap_or_else(|| vec![start])
                .into_iter()
                .map(str::to_string)
                .collect();
            path.sort();
            if let Some(first) = path.first().cloned() {
                path.push(first);
            }
            Err(SpecError::Cycle { kind: "deps", path })
        }
    }
}
