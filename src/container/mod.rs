// src/container/mod.rs

//! Container runtime collaborator.
//!
//! The executor and the service manager only talk to [`ContainerRuntime`].
//! [`DockerCli`] implements it by shelling out to a docker-compatible CLI;
//! tests substitute an in-memory fake.

pub mod docker;
pub mod user;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::engine::StatusSink;
use crate::errors::ContainerError;
use crate::types::{EnvMap, Labels};

pub use docker::DockerCli;
pub use user::HostUser;

/// Label carrying the node id on every container taskrig creates.
pub const NODE_LABEL: &str = "taskrig.node";

/// Environment variable selecting the container CLI binary.
pub const CONTAINER_CLI_ENV: &str = "TASKRIG_CONTAINER_CLI";

/// A volume attached to a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeBinding {
    /// Host path bind mount.
    Bind { host: PathBuf, container: String },
    /// Named volume, created on first use by the runtime.
    Named { name: String, container: String },
}

impl VolumeBinding {
    pub fn container(&self) -> &str {
        match self {
            VolumeBinding::Bind { container, .. } | VolumeBinding::Named { container, .. } => {
                container
            }
        }
    }

    /// `source:target` as accepted by `-v`.
    pub fn to_arg(&self) -> String {
        match self {
            VolumeBinding::Bind { host, container } => format!("{}:{container}", host.display()),
            VolumeBinding::Named { name, container } => format!("{name}:{container}"),
        }
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSpec {
    pub image: String,
    /// Replaces the image entrypoint. Task containers use the task shell
    /// with stdin held open so the container idles between execs.
    pub entrypoint: Option<String>,
    pub interactive: bool,
    pub workdir: Option<String>,
    pub labels: Labels,
    pub binds: Vec<VolumeBinding>,
    pub env: EnvMap,
    pub ports: Vec<String>,
    pub platform: Option<String>,
}

/// One command executed inside a running container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub env: EnvMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerInfo {
    pub running: bool,
    pub exit_code: i64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync + fmt::Debug {
    /// Locally present images as `repository:tag`.
    async fn list_images(&self) -> Result<Vec<String>, ContainerError>;

    async fn pull_image(&self, image: &str, platform: Option<&str>) -> Result<(), ContainerError>;

    /// Create a container and return its id.
    async fn create(&self, spec: &CreateSpec) -> Result<String, ContainerError>;

    async fn start(&self, id: &str) -> Result<(), ContainerError>;

    /// Run a command to completion, streaming stdout and stderr line by line
    /// into `sink`. Returns the exit code.
    async fn exec(&self, id: &str, spec: &ExecSpec, sink: &StatusSink)
    -> Result<i64, ContainerError>;

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, ContainerError>;

    /// Force-remove a container, running or not.
    async fn remove(&self, id: &str) -> Result<(), ContainerError>;
}

/// `image` with an explicit tag (`:latest` when none is given).
///
/// A colon inside the registry host (`localhost:5000/app`) is not a tag.
pub fn normalize_image(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains(':') || last.contains('@') {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}

/// Pull `image` unless an exact tag match is already present.
pub async fn ensure_image(
    runtime: &dyn ContainerRuntime,
    image: &str,
    platform: Option<&str>,
) -> Result<(), ContainerError> {
    let wanted = normalize_image(image);
    let present = runtime.list_images().await?;
    if present.iter().any(|img| normalize_image(img) == wanted) {
        debug!(image = %wanted, "image present locally");
        return Ok(());
    }
    info!(image = %wanted, "pulling image");
    runtime.pull_image(&wanted, platform).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_images_default_to_latest() {
        assert_eq!(normalize_image("node"), "node:latest");
        assert_eq!(normalize_image("node:20"), "node:20");
        assert_eq!(normalize_image("localhost:5000/app"), "localhost:5000/app:latest");
        assert_eq!(normalize_image("ghcr.io/org/app:1.2"), "ghcr.io/org/app:1.2");
    }

    #[test]
    fn binding_args() {
        let bind = VolumeBinding::Bind {
            host: PathBuf::from("/p/src"),
            container: "/p/src".into(),
        };
        assert_eq!(bind.to_arg(), "/p/src:/p/src");
        let named = VolumeBinding::Named {
            name: "cache".into(),
            container: "/root/.npm".into(),
        };
        assert_eq!(named.to_arg(), "cache:/root/.npm");
        assert_eq!(named.container(), "/root/.npm");
    }
}
