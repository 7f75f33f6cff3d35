// src/config/validate.rs

use std::path::Path;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{parse_duration, BuildFile, ServiceConfig, TaskConfig};
use crate::errors::SpecError;

/// Schema checks on a single build file. Cross-file problems (unknown names,
/// cycles through includes) are left to the resolver.
pub fn validate_build_file(path: &Path, file: &BuildFile) -> Result<(), SpecError> {
    validate_aliases(path, file)?;
    for (name, task) in &file.tasks {
        validate_task(name, task)?;
    }
    for (name, service) in &file.services {
        validate_service(name, service)?;
    }
    validate_local_deps(file)?;
    Ok(())
}

fn validate_aliases(path: &Path, file: &BuildFile) -> Result<(), SpecError> {
    let display = path.display().to_string();

    for alias in file.includes.keys() {
        if file.references.contains_key(alias) {
            return Err(SpecError::DuplicateAlias {
                alias: alias.clone(),
                file: display,
            });
        }
    }

    for alias in file.includes.keys().chain(file.references.keys()) {
        if alias.is_empty() || alias.contains(':') {
            return Err(SpecError::InvalidTask {
                name: alias.clone(),
                reason: "aliases must be non-empty and must not contain ':'".to_string(),
            });
        }
    }

    for name in file.tasks.keys() {
        if file.services.contains_key(name) {
            return Err(SpecError::DuplicateAlias {
                alias: name.clone(),
                file: display,
            });
        }
    }

    Ok(())
}

fn validate_name(name: &str) -> Result<(), SpecError> {
    if name.is_empty() || name.contains(':') {
        return Err(SpecError::InvalidTask {
            name: name.to_string(),
            reason: "names must be non-empty and must not contain ':'".to_string(),
        });
    }
    Ok(())
}

fn validate_task(name: &str, task: &TaskConfig) -> Result<(), SpecError> {
    validate_name(name)?;

    if task.cmds.is_empty() && task.extend.is_none() && task.deps.is_empty() {
        return Err(SpecError::InvalidTask {
            name: name.to_string(),
            reason: "task needs at least one of `cmds`, `deps` or `extend`".to_string(),
        });
    }

    if task.extend.as_deref() == Some(name) {
        return Err(SpecError::Cycle {
            kind: "extend",
            path: vec![name.to_string(), name.to_string()],
        });
    }

    if task.deps.iter().any(|d| d == name) {
        return Err(SpecError::Cycle {
            kind: "deps",
            path: vec![name.to_string(), name.to_string()],
        });
    }

    // Only an extended base may contribute an image, so container-only
    // fields on a task without one are checked after resolution.
    if task.image.is_none() && task.extend.is_none() {
        if !task.mounts.is_empty() || !task.volumes.is_empty() || task.platform.is_some() {
            return Err(SpecError::InvalidTask {
                name: name.to_string(),
                reason: "`mounts`, `volumes` and `platform` require `image`".to_string(),
            });
        }
    }

    Ok(())
}

fn validate_service(name: &str, service: &ServiceConfig) -> Result<(), SpecError> {
    validate_name(name)?;

    let invalid = |reason: &str| SpecError::InvalidTask {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    match (&service.image, &service.context) {
        (Some(_), Some(_)) => {
            return Err(invalid("service sets both `image` and `context`"));
        }
        (None, None) => {
            return Err(invalid("service needs either `image` or `context`"));
        }
        (None, Some(_)) => {
            if service.selector.is_none() {
                return Err(invalid("kubernetes service needs a `selector`"));
            }
            if service.healthcheck.is_some() {
                return Err(invalid("`healthcheck` is only supported for container services"));
            }
            if service.ports.is_empty() {
                return Err(invalid("kubernetes service needs at least one port"));
            }
        }
        (Some(_), None) => {}
    }

    if let Some(check) = &service.healthcheck {
        for value in [&check.interval, &check.timeout].into_iter().flatten() {
            parse_duration(value).map_err(|e| invalid(&format!("healthcheck: {e}")))?;
        }
    }

    Ok(())
}

fn validate_local_deps(file: &BuildFile) -> Result<(), SpecError> {
    // Edge direction: dep -> task. Only names local to this file are
    // considered; aliased names are checked once every scope is loaded.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in file.tasks.keys() {
        graph.add_node(name.as_str());
    }

    for (name, task) in &file.tasks {
        for dep in &task.deps {
            if file.tasks.contains_key(dep) {
                graph.add_edge(dep.as_str(), name.as_str(), ());
            }
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(SpecError::Cycle {
            kind: "deps",
            path: vec![cycle.node_id().to_string()],
        }),
    }
}
