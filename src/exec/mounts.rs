// src/exec/mounts.rs

//! Volume resolution for container tasks and services.
//!
//! Host paths are mounted at the same path inside the container, so commands
//! see the project at the location they would locally.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::container::VolumeBinding;
use crate::dag::{
    volume_name, ContainerSettings, ServiceMode, WorkMount, WorkNode, WorkService, WorkVolume,
};
use crate::errors::ExecError;
use crate::fs::{normalize_path, FileSystem};

/// Bindings of a container task, deduplicated by container path (first
/// wins), in this order:
///
/// 1. source bases (missing ones are skipped with a warning)
/// 2. explicit `mounts`
/// 3. explicit `volumes`
/// 4. outputs inherited from dependencies
/// 5. the task's own outputs: directories as named volumes, files bound when
///    they already exist
pub fn resolve_volumes(
    node: &WorkNode,
    settings: &ContainerSettings,
    fs: &dyn FileSystem,
    home: Option<&Path>,
) -> Result<Vec<VolumeBinding>, ExecError> {
    let mut bindings = Vec::new();

    for matcher in &node.src {
        let base = matcher.base();
        if !fs.exists(base) {
            warn!(task = %node.key, path = %base.display(), "source missing on disk; not mounted");
            continue;
        }
        bindings.push(VolumeBinding::Bind {
            host: base.to_path_buf(),
            container: base.to_string_lossy().to_string(),
        });
    }

    for mount in &settings.mounts {
        bindings.push(parse_mount(mount, &node.cwd, home)?);
    }
    for volume in &settings.volumes {
        bindings.push(parse_volume(volume)?);
    }

    push_inherited(
        &mut bindings,
        &settings.inherited_volumes,
        &settings.inherited_mounts,
        fs,
        &node.key,
    );

    for artifact in node.generates.iter().filter(|g| !g.inherited) {
        let container = artifact.path.to_string_lossy().to_string();
        if !artifact.is_file {
            bindings.push(VolumeBinding::Named {
                name: volume_name(&artifact.path),
                container,
            });
        } else if fs.exists(&artifact.path) {
            bindings.push(VolumeBinding::Bind {
                host: artifact.path.clone(),
                container,
            });
        }
    }

    Ok(dedup(bindings))
}

/// Bindings of a container service: its `mounts`, its `volumes`, then the
/// outputs of the tasks it depends on. Services have no sources or outputs
/// of their own.
pub fn service_volumes(
    service: &WorkService,
    fs: &dyn FileSystem,
    home: Option<&Path>,
) -> Result<Vec<VolumeBinding>, ExecError> {
    let ServiceMode::Container {
        mounts,
        volumes,
        inherited_volumes,
        inherited_mounts,
        ..
    } = &service.mode
    else {
        return Ok(Vec::new());
    };

    let mut bindings = Vec::new();
    for mount in mounts {
        bindings.push(parse_mount(mount, &service.cwd, home)?);
    }
    for volume in volumes {
        bindings.push(parse_volume(volume)?);
    }
    push_inherited(&mut bindings, inherited_volumes, inherited_mounts, fs, &service.key);
    Ok(dedup(bindings))
}

/// Directory outputs travel through their named volume; file outputs are
/// bound only once a dependency actually produced them.
fn push_inherited(
    bindings: &mut Vec<VolumeBinding>,
    volumes: &[WorkVolume],
    mounts: &[WorkMount],
    fs: &dyn FileSystem,
    key: &str,
) {
    for volume in volumes {
        bindings.push(VolumeBinding::Named {
            name: volume.name.clone(),
            container: volume.container.clone(),
        });
    }
    for mount in mounts {
        if fs.exists(&mount.local) {
            bindings.push(VolumeBinding::Bind {
                host: mount.local.clone(),
                container: mount.container.clone(),
            });
        } else {
            debug!(task = %key, path = %mount.local.display(), "inherited file not produced");
        }
    }
}

fn dedup(bindings: Vec<VolumeBinding>) -> Vec<VolumeBinding> {
    let mut seen = HashSet::new();
    bindings
        .into_iter()
        .filter(|b| seen.insert(b.container().to_string()))
        .collect()
}

/// Parse a `mounts` entry: `local:container` or a single path mounted at
/// the same location. `local` may be absolute, home relative (`~/...`) or
/// relative to `cwd`.
pub fn parse_mount(
    spec: &str,
    cwd: &Path,
    home: Option<&Path>,
) -> Result<VolumeBinding, ExecError> {
    let invalid = |reason: &str| ExecError::InvalidMount {
        mount: spec.to_string(),
        reason: reason.to_string(),
    };

    let (local, container) = match spec.split_once(':') {
        Some((local, container)) => (local, Some(container)),
        None => (spec, None),
    };
    if local.is_empty() {
        return Err(invalid("empty host path"));
    }

    let host = if local == "~" || local.starts_with("~/") {
        let home = home.ok_or_else(|| invalid("home directory unknown"))?;
        normalize_path(&home.join(local.trim_start_matches('~').trim_start_matches('/')))
    } else {
        let path = PathBuf::from(local);
        if path.is_absolute() {
            normalize_path(&path)
        } else {
            normalize_path(&cwd.join(path))
        }
    };

    let container = match container {
        Some(c) if c.starts_with('/') => c.to_string(),
        Some(_) => return Err(invalid("container path must be absolute")),
        None => host.to_string_lossy().to_string(),
    };

    Ok(VolumeBinding::Bind { host, container })
}

/// Parse a `volumes` entry: `name:container`.
pub fn parse_volume(spec: &str) -> Result<VolumeBinding, ExecError> {
    match spec.split_once(':') {
        Some((name, container)) if !name.is_empty() && container.starts_with('/') => {
            Ok(VolumeBinding::Named {
                name: name.to_string(),
                container: container.to_string(),
            })
        }
        _ => Err(ExecError::InvalidMount {
            mount: spec.to_string(),
            reason: "expected name:/absolute/path".to_string(),
        }),
    }
}
