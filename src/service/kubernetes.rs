// src/service/kubernetes.rs

use std::process::Stdio;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::dag::{ServiceMode, WorkService};
use crate::engine::{CancelSignal, StatusSink};
use crate::service::{report_end, report_ready, ServiceContext};
use crate::types::LogStream;

static FORWARDING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Forwarding from \S+ -> \d+").expect("forwarding regex is valid")
});

/// `kubectl` arguments forwarding the service's ports.
pub fn port_forward_args(context: &str, kind: &str, name: &str, ports: &[String]) -> Vec<String> {
    let mut args = vec![
        "--context".to_string(),
        context.to_string(),
        "port-forward".to_string(),
        format!("{kind}/{name}"),
    ];
    args.extend(ports.iter().cloned());
    args
}

pub fn is_forwarding_line(line: &str) -> bool {
    FORWARDING.is_match(line.trim())
}

/// Keep a `kubectl port-forward` running for the service. Ready once kubectl
/// reports its first forwarded port; killed on cancellation.
pub(super) async fn run_port_forward(
    service: Arc<WorkService>,
    ctx: ServiceContext,
    sink: StatusSink,
    cancel: CancelSignal,
) {
    let ServiceMode::Kubernetes { context, selector } = &service.mode else {
        return;
    };

    let args = port_forward_args(context, &selector.kind, &selector.name, &service.ports);
    info!(service = %service.key, ?args, "starting port forward");

    let spawned = Command::new(&ctx.kubectl)
        .args(&args)
        .envs(&service.envs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            let reason = format!("failed to run '{}': {err}", ctx.kubectl);
            sink.system(reason.clone()).await;
            report_end(&ctx, &service.id, Some(reason)).await;
            return;
        }
    };

    if let Some(stderr) = child.stderr.take() {
        let _ = sink.forward(stderr, LogStream::Stderr);
    }
    let Some(stdout) = child.stdout.take() else {
        report_end(&ctx, &service.id, Some("kubectl stdout unavailable".to_string())).await;
        return;
    };
    let mut lines = BufReader::new(stdout).lines();
    let mut ready = false;

    let failure = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !ready && is_forwarding_line(&line) {
                        ready = true;
                        report_ready(&ctx, &service.id).await;
                    }
                    sink.line(LogStream::Stdout, line).await;
                }
                // Output closed: wait for the exit status below.
                Ok(None) | Err(_) => {
                    let status = tokio::select! {
                        status = child.wait() => status,
                        _ = cancel.cancelled() => break None,
                    };
                    break Some(match status {
                        Ok(status) => format!("port-forward exited with {status}"),
                        Err(err) => format!("port-forward failed: {err}"),
                    });
                }
            },
            _ = cancel.cancelled() => break None,
        }
    };

    match failure {
        Some(reason) => {
            warn!(service = %service.key, reason = %reason, "port forward ended");
            report_end(&ctx, &service.id, Some(reason)).await;
        }
        None => {
            debug!(service = %service.key, "stopping port forward");
            if let Err(err) = child.kill().await {
                warn!(service = %service.key, error = %err, "failed to kill kubectl");
            }
        }
    }
}
