// src/cache/identity.rs

//! Canonical node identity.
//!
//! A node is reduced to a [`CanonicalNode`] with every unordered list sorted,
//! serialised to JSON with sorted object keys and hashed with SHA-1. Command
//! order is kept: running `a; b` is not the same as `b; a`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::dag::{ExecutionMode, ServiceMode, WorkNode, WorkService};
use crate::types::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalCommand {
    pub cmd: String,
    pub cwd: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalNode {
    pub cwd: String,
    pub shell: String,
    pub cache: String,
    pub image: Option<String>,
    pub platform: Option<String>,
    pub cmds: Vec<CanonicalCommand>,
    pub envs: BTreeMap<String, String>,
    pub src: Vec<String>,
    pub generates: Vec<String>,
    pub mounts: Vec<String>,
    pub volumes: Vec<String>,
    pub ports: Vec<String>,
    pub deps: Vec<String>,
    pub needs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalService {
    pub cwd: String,
    pub image: Option<String>,
    pub context: Option<String>,
    pub selector: Option<String>,
    pub healthcheck: Option<String>,
    pub envs: BTreeMap<String, String>,
    pub ports: Vec<String>,
    pub mounts: Vec<String>,
    pub volumes: Vec<String>,
    pub deps: Vec<String>,
    pub needs: Vec<String>,
}

fn sorted<I: IntoIterator<Item = String>>(items: I) -> Vec<String> {
    let mut out: Vec<String> = items.into_iter().collect();
    out.sort();
    out.dedup();
    out
}

impl CanonicalNode {
    pub fn from_node(node: &WorkNode) -> Self {
        let (image, platform, mounts, volumes, ports) = match &node.mode {
            ExecutionMode::Local => (None, None, Vec::new(), Vec::new(), Vec::new()),
            ExecutionMode::Container(c) => {
                let mounts = c.mounts.iter().cloned().chain(
                    c.inherited_mounts
                        .iter()
                        .map(|m| format!("{}:{}", m.local.display(), m.container)),
                );
                let volumes = c.volumes.iter().cloned().chain(
                    c.inherited_volumes
                        .iter()
                        .map(|v| format!("{}:{}", v.name, v.container)),
                );
                (
                    Some(c.image.clone()),
                    c.platform.clone(),
                    sorted(mounts),
                    sorted(volumes),
                    sorted(c.ports.iter().cloned()),
                )
            }
        };

        CanonicalNode {
            cwd: node.cwd.display().to_string(),
            shell: node.shell.clone(),
            cache: node.cache.as_str().to_string(),
            image,
            platform,
            cmds: node
                .cmds
                .iter()
                .map(|c| CanonicalCommand {
                    cmd: c.cmd.clone(),
                    cwd: c.cwd.display().to_string(),
                })
                .collect(),
            envs: node.envs.clone(),
            src: sorted(node.src.iter().map(|s| s.pattern().to_string())),
            generates: sorted(node.generates.iter().map(|g| {
                let kind = if g.is_file { "file" } else { "dir" };
                format!("{}:{kind}", g.path.display())
            })),
            mounts,
            volumes,
            ports,
            deps: sorted(node.deps.iter().cloned()),
            needs: sorted(node.needs.iter().cloned()),
        }
    }
}

impl CanonicalService {
    pub fn from_service(service: &WorkService) -> Self {
        let mut canonical = CanonicalService {
            cwd: service.cwd.display().to_string(),
            image: None,
            context: None,
            selector: None,
            healthcheck: None,
            envs: service.envs.clone(),
            ports: sorted(service.ports.iter().cloned()),
            mounts: Vec::new(),
            volumes: Vec::new(),
            deps: sorted(service.deps.iter().cloned()),
            needs: sorted(service.needs.iter().cloned()),
        };

        match &service.mode {
            ServiceMode::Container {
                image,
                mounts,
                volumes,
                healthcheck,
                inherited_volumes,
                inherited_mounts,
            } => {
                canonical.image = Some(image.clone());
                canonical.mounts = sorted(mounts.iter().cloned().chain(
                    inherited_mounts
                        .iter()
                        .map(|m| format!("{}:{}", m.local.display(), m.container)),
                ));
                canonical.volumes = sorted(volumes.iter().cloned().chain(
                    inherited_volumes
                        .iter()
                        .map(|v| format!("{}:{}", v.name, v.container)),
                ));
                canonical.healthcheck = healthcheck.as_ref().map(|h| h.cmd.clone());
            }
            ServiceMode::Kubernetes { context, selector } => {
                canonical.context = Some(context.clone());
                canonical.selector = Some(format!("{}/{}", selector.kind, selector.name));
            }
        }

        canonical
    }
}

/// JSON with object keys in sorted order.
pub fn canonical_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    // `Value` objects are BTreeMap backed, so re-serialising sorts struct
    // fields as well as map keys.
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&value)
}

/// Lowercase hex SHA-1 of `data` (40 characters).
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn identity_of<T: Serialize>(value: &T) -> serde_json::Result<NodeId> {
    Ok(sha1_hex(canonical_json(value)?.as_bytes()))
}

pub fn node_identity(node: &WorkNode) -> serde_json::Result<NodeId> {
    identity_of(&CanonicalNode::from_node(node))
}

pub fn service_identity(service: &WorkService) -> serde_json::Result<NodeId> {
    identity_of(&CanonicalService::from_service(service))
}
