// src/service/container.rs

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::container::{ensure_image, CreateSpec, ExecSpec, VolumeBinding, NODE_LABEL};
use crate::dag::{ServiceMode, WorkService};
use crate::engine::{CancelSignal, StatusSink};
use crate::exec::mounts::service_volumes;
use crate::resolve::Healthcheck;
use crate::service::{report_end, report_ready, ServiceContext};

/// How often a ready service container is checked for an unexpected exit.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(2);

pub(super) async fn run_container_service(
    service: Arc<WorkService>,
    ctx: ServiceContext,
    sink: StatusSink,
    cancel: CancelSignal,
) {
    let ServiceMode::Container { image, healthcheck, .. } = &service.mode else {
        return;
    };

    let binds = match service_volumes(&service, ctx.fs.as_ref(), ctx.home.as_deref()) {
        Ok(binds) => binds,
        Err(err) => return fail(&ctx, &service, &sink, err.to_string()).await,
    };

    tokio::select! {
        pulled = ensure_image(ctx.containers.as_ref(), image, None) => {
            if let Err(err) = pulled {
                return fail(&ctx, &service, &sink, err.to_string()).await;
            }
        }
        _ = cancel.cancelled() => return,
    }

    let id = match create_and_start(&service, image, binds, &ctx).await {
        Ok(id) => id,
        Err(reason) => return fail(&ctx, &service, &sink, reason).await,
    };
    info!(service = %service.key, container = %id, "service container started");

    let failure = tokio::select! {
        reason = supervise(&service, &id, healthcheck.as_ref(), &ctx, &sink) => Some(reason),
        _ = cancel.cancelled() => None,
    };
    if let Some(reason) = failure {
        warn!(service = %service.key, reason = %reason, "service ended");
        sink.system(format!("service ended: {reason}")).await;
        report_end(&ctx, &service.id, Some(reason)).await;
    }

    if let Err(err) = ctx.containers.remove(&id).await {
        warn!(service = %service.key, container = %id, error = %err, "failed to remove service container");
    } else {
        debug!(service = %service.key, container = %id, "service container removed");
    }
}

async fn fail(ctx: &ServiceContext, service: &WorkService, sink: &StatusSink, reason: String) {
    warn!(service = %service.key, reason = %reason, "service failed to start");
    sink.system(reason.clone()).await;
    report_end(ctx, &service.id, Some(reason)).await;
}

async fn create_and_start(
    service: &WorkService,
    image: &str,
    binds: Vec<VolumeBinding>,
    ctx: &ServiceContext,
) -> Result<String, String> {
    let spec = CreateSpec {
        image: image.to_string(),
        labels: [(NODE_LABEL.to_string(), service.id.clone())].into(),
        binds,
        env: service.envs.clone(),
        ports: service.ports.clone(),
        ..Default::default()
    };
    let id = ctx.containers.create(&spec).await.map_err(|e| e.to_string())?;

    if let Err(err) = ctx.containers.start(&id).await {
        if let Err(remove) = ctx.containers.remove(&id).await {
            warn!(container = %id, error = %remove, "failed to remove container after start failure");
        }
        return Err(err.to_string());
    }
    Ok(id)
}

/// Gate readiness on the health check, then watch the container until it
/// exits. Only returns on failure.
async fn supervise(
    service: &WorkService,
    id: &str,
    healthcheck: Option<&Healthcheck>,
    ctx: &ServiceContext,
    sink: &StatusSink,
) -> String {
    if let Some(hc) = healthcheck {
        if let Err(reason) = wait_healthy(id, hc, ctx, sink).await {
            return reason;
        }
    }
    report_ready(ctx, &service.id).await;

    loop {
        tokio::time::sleep(MONITOR_INTERVAL).await;
        match ctx.containers.inspect(id).await {
            Ok(info) if info.running => {}
            Ok(info) => return format!("exited with code {}", info.exit_code),
            Err(err) => return err.to_string(),
        }
    }
}

/// Run the health check until it exits 0. Each attempt is bounded by the
/// check's timeout; `retries` caps the number of attempts.
pub async fn wait_healthy(
    id: &str,
    hc: &Healthcheck,
    ctx: &ServiceContext,
    sink: &StatusSink,
) -> Result<(), String> {
    let exec = ExecSpec {
        cmd: vec!["sh".to_string(), "-c".to_string(), hc.cmd.clone()],
        ..Default::default()
    };

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match tokio::time::timeout(hc.timeout, ctx.containers.exec(id, &exec, sink)).await {
            Ok(Ok(0)) => {
                debug!(container = %id, attempt, "health check passed");
                return Ok(());
            }
            Ok(Ok(code)) => debug!(container = %id, attempt, exit_code = code, "health check not passing yet"),
            Ok(Err(err)) => {
                debug!(container = %id, attempt, error = %err, "health check could not run");
                if let Ok(info) = ctx.containers.inspect(id).await {
                    if !info.running {
                        return Err(format!("exited with code {} before becoming healthy", info.exit_code));
                    }
                }
            }
            Err(_) => debug!(container = %id, attempt, timeout = ?hc.timeout, "health check timed out"),
        }

        if hc.retries.is_some_and(|max| attempt >= max) {
            return Err(format!("health check failed after {attempt} attempts"));
        }
        tokio::time::sleep(hc.interval).await;
    }
}
