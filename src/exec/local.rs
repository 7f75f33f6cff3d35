// src/exec/local.rs

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::dag::{WorkCommand, WorkNode};
use crate::engine::{CancelSignal, StatusSink};
use crate::errors::ExecError;
use crate::types::{EnvMap, LogStream};

/// Run the commands of `node` one after another on the host.
///
/// Each command gets the process environment overlaid with the task's own
/// variables and runs in its working directory. The first command that does
/// not exit with 0 stops the task.
pub async fn run_local(
    node: &WorkNode,
    process_env: &EnvMap,
    sink: &StatusSink,
    cancel: &CancelSignal,
) -> Result<(), ExecError> {
    for cmd in &node.cmds {
        if cancel.is_cancelled() {
            return Err(ExecError::Canceled);
        }
        run_command(node, cmd, process_env, sink, cancel).await?;
    }
    Ok(())
}

async fn run_command(
    node: &WorkNode,
    cmd: &WorkCommand,
    process_env: &EnvMap,
    sink: &StatusSink,
    cancel: &CancelSignal,
) -> Result<(), ExecError> {
    info!(task = %node.key, cmd = %cmd.cmd, cwd = %cmd.cwd.display(), "running command");

    let mut child = Command::new(&node.shell)
        .arg("-c")
        .arg(&cmd.cmd)
        .current_dir(&cmd.cwd)
        .env_clear()
        .envs(process_env)
        .envs(&node.envs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecError::Spawn {
            cmd: cmd.cmd.clone(),
            reason: e.to_string(),
        })?;

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(sink.forward(stdout, LogStream::Stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(sink.forward(stderr, LogStream::Stderr));
    }

    let status = tokio::select! {
        status = child.wait() => status.map_err(|e| ExecError::Spawn {
            cmd: cmd.cmd.clone(),
            reason: e.to_string(),
        })?,
        _ = cancel.cancelled() => {
            info!(task = %node.key, "cancellation requested; killing process");
            if let Err(e) = child.kill().await {
                warn!(task = %node.key, error = %e, "failed to kill child process on cancellation");
            }
            return Err(ExecError::Canceled);
        }
    };

    for reader in readers {
        let _ = reader.await;
    }

    match status.code() {
        Some(0) => {
            debug!(task = %node.key, cmd = %cmd.cmd, "command succeeded");
            Ok(())
        }
        Some(code) => Err(ExecError::Crashed {
            code: i64::from(code),
        }),
        None => Err(ExecError::Killed),
    }
}
