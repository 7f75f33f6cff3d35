// src/exec/container.rs

use std::path::Path;

use tracing::{debug, info, warn};

use crate::container::{
    ensure_image, ContainerRuntime, CreateSpec, ExecSpec, HostUser, VolumeBinding, NODE_LABEL,
};
use crate::dag::{ContainerSettings, WorkNode};
use crate::engine::{CancelSignal, StatusSink};
use crate::errors::ExecError;
use crate::exec::mounts::resolve_volumes;
use crate::fs::FileSystem;

/// Collaborators of a container execution.
#[derive(Debug, Clone, Copy)]
pub struct ContainerEnv<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub fs: &'a dyn FileSystem,
    pub home: Option<&'a Path>,
    pub host_user: Option<HostUser>,
}

/// Run the commands of `node` inside a fresh container.
///
/// The container is removed afterwards whatever the outcome.
pub async fn run_container(
    node: &WorkNode,
    settings: &ContainerSettings,
    env: ContainerEnv<'_>,
    sink: &StatusSink,
    cancel: &CancelSignal,
) -> Result<(), ExecError> {
    let binds = resolve_volumes(node, settings, env.fs, env.home)?;

    tokio::select! {
        pulled = ensure_image(env.runtime, &settings.image, settings.platform.as_deref()) => pulled?,
        _ = cancel.cancelled() => return Err(ExecError::Canceled),
    }

    let spec = CreateSpec {
        image: settings.image.clone(),
        entrypoint: Some(node.shell.clone()),
        interactive: true,
        workdir: Some(node.cwd.to_string_lossy().to_string()),
        labels: [(NODE_LABEL.to_string(), node.id.clone())].into(),
        binds,
        env: node.envs.clone(),
        ports: settings.ports.clone(),
        platform: settings.platform.clone(),
    };
    let id = env.runtime.create(&spec).await?;
    debug!(task = %node.key, container = %id, "container created");

    let result = tokio::select! {
        r = run_in(node, &id, &spec.binds, env, sink) => r,
        _ = cancel.cancelled() => {
            info!(task = %node.key, container = %id, "cancellation requested; removing container");
            Err(ExecError::Canceled)
        }
    };

    if let Err(err) = env.runtime.remove(&id).await {
        warn!(task = %node.key, container = %id, error = %err, "failed to remove container");
    }
    result
}

async fn run_in(
    node: &WorkNode,
    id: &str,
    binds: &[VolumeBinding],
    env: ContainerEnv<'_>,
    sink: &StatusSink,
) -> Result<(), ExecError> {
    env.runtime.start(id).await?;

    if let Some(user) = env.host_user {
        fix_ownership(node, id, binds, user, env.runtime, sink).await;
    }

    for cmd in &node.cmds {
        info!(task = %node.key, cmd = %cmd.cmd, "running command in container");
        let exec = ExecSpec {
            cmd: vec![node.shell.clone(), "-c".to_string(), cmd.cmd.clone()],
            workdir: Some(cmd.cwd.to_string_lossy().to_string()),
            user: None,
            env: Default::default(),
        };
        let code = env.runtime.exec(id, &exec, sink).await?;
        if code != 0 {
            return Err(ExecError::Crashed { code });
        }
    }
    Ok(())
}

/// Hand the working directory and every mounted path to the host user so
/// outputs are not left owned by root. Failures only warn.
async fn fix_ownership(
    node: &WorkNode,
    id: &str,
    binds: &[VolumeBinding],
    user: HostUser,
    runtime: &dyn ContainerRuntime,
    sink: &StatusSink,
) {
    let mut cmd = vec![
        "chown".to_string(),
        "-R".to_string(),
        user.to_string(),
        node.cwd.to_string_lossy().to_string(),
    ];
    cmd.extend(binds.iter().map(|b| b.container().to_string()));

    let exec = ExecSpec {
        cmd,
        workdir: None,
        user: Some("0".to_string()),
        env: Default::default(),
    };
    match runtime.exec(id, &exec, sink).await {
        Ok(0) => debug!(task = %node.key, %user, "ownership fixed"),
        Ok(code) => warn!(task = %node.key, exit_code = code, "chown exited non-zero"),
        Err(err) => warn!(task = %node.key, error = %err, "chown failed"),
    }
}
