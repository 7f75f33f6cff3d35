// src/exec/task_runner.rs

//! One execution attempt of a work node.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;
use crate::container::{ContainerRuntime, HostUser};
use crate::dag::{ExecutionMode, WorkNode};
use crate::engine::{CancelSignal, RuntimeEvent, StatusSink, TaskOutcome, TaskPhase};
use crate::errors::ExecError;
use crate::exec::container::{run_container, ContainerEnv};
use crate::exec::local::run_local;
use crate::fs::FileSystem;
use crate::types::EnvMap;

/// Shared, read-only collaborators of every execution in a run.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub process_env: Arc<EnvMap>,
    pub cache: CacheStore,
    /// When false no execution is skipped, but manifests are still written.
    pub cache_enabled: bool,
    pub fs: Arc<dyn FileSystem>,
    pub containers: Arc<dyn ContainerRuntime>,
    host_user: Arc<OnceCell<Option<HostUser>>>,
}

impl ExecContext {
    pub fn new(
        process_env: EnvMap,
        cache: CacheStore,
        cache_enabled: bool,
        fs: Arc<dyn FileSystem>,
        containers: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            process_env: Arc::new(process_env),
            cache,
            cache_enabled,
            fs,
            containers,
            host_user: Arc::new(OnceCell::new()),
        }
    }

    fn home(&self) -> Option<PathBuf> {
        self.process_env.get("HOME").map(PathBuf::from)
    }

    /// Detected once per run, on the first container task.
    async fn host_user(&self) -> Option<HostUser> {
        *self.host_user.get_or_init(HostUser::detect).await
    }
}

/// Execute `node` and report progress and the final outcome to the
/// scheduler. Never fails itself: every error becomes an outcome.
pub async fn run_task(
    node: Arc<WorkNode>,
    ctx: ExecContext,
    sink: StatusSink,
    cancel: CancelSignal,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
) {
    let outcome = run_task_inner(&node, &ctx, &sink, &cancel, &runtime_tx).await;

    match &outcome {
        TaskOutcome::Error(message) => {
            error!(task = %node.key, error = %message, "task execution error");
            sink.system(message.clone()).await;
        }
        TaskOutcome::Crashed(code) => {
            sink.system(format!("failed with code {code}")).await;
        }
        _ => {}
    }

    if runtime_tx
        .send(RuntimeEvent::TaskFinished {
            node: node.id.clone(),
            outcome,
        })
        .await
        .is_err()
    {
        debug!(task = %node.key, "runtime gone; dropping task result");
    }
}

async fn run_task_inner(
    node: &WorkNode,
    ctx: &ExecContext,
    sink: &StatusSink,
    cancel: &CancelSignal,
    runtime_tx: &mpsc::Sender<RuntimeEvent>,
) -> TaskOutcome {
    let started = Instant::now();
    let progress = |phase| RuntimeEvent::TaskProgress {
        node: node.id.clone(),
        phase,
    };

    let cached = ctx.cache_enabled && ctx.cache.is_cached(node);
    let _ = runtime_tx.send(progress(TaskPhase::Ready)).await;

    if cached {
        info!(task = %node.key, "sources unchanged; skipping");
        return TaskOutcome::Completed {
            duration: started.elapsed(),
            cached: true,
        };
    }
    if cancel.is_cancelled() {
        return TaskOutcome::Canceled;
    }

    let _ = runtime_tx.send(progress(TaskPhase::Running)).await;
    info!(task = %node.key, id = %node.short_id(), "starting task");

    let result = match &node.mode {
        ExecutionMode::Local => run_local(node, &ctx.process_env, sink, cancel).await,
        ExecutionMode::Container(settings) => {
            let home = ctx.home();
            let env = ContainerEnv {
                runtime: ctx.containers.as_ref(),
                fs: ctx.fs.as_ref(),
                home: home.as_deref(),
                host_user: ctx.host_user().await,
            };
            run_container(node, settings, env, sink, cancel).await
        }
    };

    match result {
        Ok(()) => {
            if let Err(err) = ctx.cache.record_execution(node) {
                warn!(task = %node.key, error = %err, "failed to record cache manifest");
                ctx.cache.invalidate(&node.id);
            }
            TaskOutcome::Completed {
                duration: started.elapsed(),
                cached: false,
            }
        }
        Err(err) => {
            ctx.cache.invalidate(&node.id);
            match err {
                ExecError::Canceled => TaskOutcome::Canceled,
                ExecError::Crashed { code } => TaskOutcome::Crashed(code),
                other => TaskOutcome::Error(other.to_string()),
            }
        }
    }
}
