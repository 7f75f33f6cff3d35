// src/container/docker.rs

use std::io;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::container::{ContainerInfo, ContainerRuntime, CreateSpec, ExecSpec};
use crate::engine::StatusSink;
use crate::errors::ContainerError;
use crate::types::LogStream;

/// [`ContainerRuntime`] backed by the `docker` CLI (or a compatible one such
/// as `podman`).
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Run to completion; stdout on success, stderr as the error otherwise.
    async fn output(&self, args: &[String]) -> Result<String, String> {
        debug!(binary = %self.binary, ?args, "container cli");
        let out = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|e| self.spawn_error(&e))?;
        check(out)
    }

    fn spawn_error(&self, err: &io::Error) -> String {
        if err.kind() == io::ErrorKind::NotFound {
            format!("'{}' not found in PATH", self.binary)
        } else {
            format!("failed to run '{}': {err}", self.binary)
        }
    }

    fn unavailable(&self, reason: String) -> ContainerError {
        ContainerError::Unavailable(reason)
    }
}

fn check(out: Output) -> Result<String, String> {
    if out.status.success() {
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        Err(match out.status.code() {
            Some(code) if stderr.is_empty() => format!("exit code {code}"),
            _ => stderr,
        })
    }
}

/// Arguments of `create` for `spec`.
pub fn create_args(spec: &CreateSpec) -> Vec<String> {
    let mut args = vec!["create".to_string()];
    if spec.interactive {
        args.push("-i".into());
    }
    if let Some(entrypoint) = &spec.entrypoint {
        args.push("--entrypoint".into());
        args.push(entrypoint.clone());
    }
    if let Some(workdir) = &spec.workdir {
        args.push("-w".into());
        args.push(workdir.clone());
    }
    if let Some(platform) = &spec.platform {
        args.push("--platform".into());
        args.push(platform.clone());
    }
    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{key}={value}"));
    }
    for bind in &spec.binds {
        args.push("-v".into());
        args.push(bind.to_arg());
    }
    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    for port in &spec.ports {
        args.push("-p".into());
        args.push(port.clone());
    }
    args.push(spec.image.clone());
    args
}

/// Arguments of `exec` for `spec` in container `id`.
pub fn exec_args(id: &str, spec: &ExecSpec) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if let Some(user) = &spec.user {
        args.push("-u".into());
        args.push(user.clone());
    }
    if let Some(workdir) = &spec.workdir {
        args.push("-w".into());
        args.push(workdir.clone());
    }
    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    args.push(id.to_string());
    args.extend(spec.cmd.iter().cloned());
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_images(&self) -> Result<Vec<String>, ContainerError> {
        let args = [
            "images".to_string(),
            "--format".to_string(),
            "{{.Repository}}:{{.Tag}}".to_string(),
        ];
        let out = self.output(&args).await.map_err(|e| self.unavailable(e))?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.contains("<none>"))
            .map(str::to_string)
            .collect())
    }

    async fn pull_image(&self, image: &str, platform: Option<&str>) -> Result<(), ContainerError> {
        let mut args = vec!["pull".to_string()];
        if let Some(platform) = platform {
            args.push("--platform".into());
            args.push(platform.to_string());
        }
        args.push(image.to_string());
        self.output(&args)
            .await
            .map(|_| ())
            .map_err(|reason| ContainerError::Pull {
                image: image.to_string(),
                reason,
            })
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String, ContainerError> {
        let id = self
            .output(&create_args(spec))
            .await
            .map_err(|reason| ContainerError::Create {
                image: spec.image.clone(),
                reason,
            })?;
        // Warnings may precede the id.
        Ok(id.lines().last().unwrap_or_default().trim().to_string())
    }

    async fn start(&self, id: &str) -> Result<(), ContainerError> {
        self.output(&["start".to_string(), id.to_string()])
            .await
            .map(|_| ())
            .map_err(|reason| ContainerError::Start {
                id: id.to_string(),
                reason,
            })
    }

    async fn exec(
        &self,
        id: &str,
        spec: &ExecSpec,
        sink: &StatusSink,
    ) -> Result<i64, ContainerError> {
        let exec_error = |reason: String| ContainerError::Exec {
            id: id.to_string(),
            reason,
        };

        let mut child = self
            .command()
            .args(exec_args(id, spec))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| exec_error(self.spawn_error(&e)))?;

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(sink.forward(stdout, LogStream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(sink.forward(stderr, LogStream::Stderr));
        }

        let status = child.wait().await.map_err(|e| exec_error(e.to_string()))?;
        for reader in readers {
            let _ = reader.await;
        }

        Ok(status.code().map(i64::from).unwrap_or(-1))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, ContainerError> {
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Running}} {{.State.ExitCode}}".to_string(),
            id.to_string(),
        ];
        let out = self
            .output(&args)
            .await
            .map_err(|reason| ContainerError::Inspect {
                id: id.to_string(),
                reason,
            })?;
        parse_inspect(&out).ok_or_else(|| ContainerError::Inspect {
            id: id.to_string(),
            reason: format!("unexpected inspect output '{out}'"),
        })
    }

    async fn remove(&self, id: &str) -> Result<(), ContainerError> {
        self.output(&["rm".to_string(), "-f".to_string(), id.to_string()])
            .await
            .map(|_| ())
            .map_err(|reason| ContainerError::Remove {
                id: id.to_string(),
                reason,
            })
    }
}

fn parse_inspect(out: &str) -> Option<ContainerInfo> {
    let mut parts = out.split_whitespace();
    let running = parts.next()?.parse::<bool>().ok()?;
    let exit_code = parts.next()?.parse::<i64>().ok()?;
    Some(ContainerInfo { running, exit_code })
}
