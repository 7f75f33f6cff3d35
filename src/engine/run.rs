// src/engine/run.rs

//! Entry point for executing a work graph with the production backends.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{CacheStore, DEFAULT_CACHE_DIR};
use crate::container::{ContainerRuntime, DockerCli, CONTAINER_CLI_ENV};
use crate::dag::{Selection, WorkGraph};
use crate::engine::cancel::CancelSignal;
use crate::engine::events::{RunEvent, RuntimeEvent};
use crate::engine::runtime::Runtime;
use crate::engine::scheduler::{RunSummary, Scheduler, SchedulerOptions};
use crate::errors::Result;
use crate::exec::{ExecContext, RealExecutorBackend};
use crate::fs::FileSystem;
use crate::service::{ServiceContext, ServiceManager};
use crate::types::EnvMap;
use crate::watch::{NoopWatch, NotifyWatchBackend};

/// Environment variable selecting the kubectl binary.
pub const KUBECTL_ENV: &str = "TASKRIG_KUBECTL";

/// Capacity of the runtime and run event channels.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub concurrency: usize,
    pub watch: bool,
    pub cache_enabled: bool,
    /// Defaults to `<cwd>/.taskrig/cache`.
    pub cache_dir: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            watch: false,
            cache_enabled: true,
            cache_dir: None,
        }
    }
}

/// Ambient inputs of a run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Project directory; the cache lives below it.
    pub cwd: PathBuf,
    /// Process environment, used as fallback for local commands.
    pub env: EnvMap,
    /// Raising it cancels the run.
    pub cancel: CancelSignal,
    pub fs: Arc<dyn FileSystem>,
}

/// A running graph: a stream of state and log events, and the final
/// summary once everything settled.
#[derive(Debug)]
pub struct RunHandle {
    pub events: mpsc::Receiver<RunEvent>,
    pub summary: JoinHandle<Result<RunSummary>>,
}

/// Run the tasks of `graph` picked by `selection` with the real executor,
/// service manager and (in watch mode) file watcher.
///
/// Must be called inside a Tokio runtime. The event stream has to be drained
/// for the run to make progress.
pub fn run_graph(
    graph: Arc<WorkGraph>,
    selection: &Selection,
    options: RunOptions,
    ctx: RunContext,
) -> Result<RunHandle> {
    let selected = graph.select(selection)?;

    let (runtime_tx, runtime_rx) = mpsc::channel::<RuntimeEvent>(CHANNEL_CAPACITY);
    let (events_tx, events_rx) = mpsc::channel::<RunEvent>(CHANNEL_CAPACITY);

    let cache_dir = options
        .cache_dir
        .clone()
        .unwrap_or_else(|| ctx.cwd.join(DEFAULT_CACHE_DIR));
    let containers: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new(
        ctx.env
            .get(CONTAINER_CLI_ENV)
            .cloned()
            .unwrap_or_else(|| "docker".to_string()),
    ));
    let home = ctx.env.get("HOME").map(PathBuf::from);

    let exec_ctx = ExecContext::new(
        ctx.env.clone(),
        CacheStore::new(Arc::clone(&ctx.fs), cache_dir.clone()),
        options.cache_enabled,
        Arc::clone(&ctx.fs),
        Arc::clone(&containers),
    );
    let executor = RealExecutorBackend::new(
        exec_ctx,
        runtime_tx.clone(),
        events_tx.clone(),
        ctx.cancel.clone(),
    );

    let services = ServiceManager::new(
        ServiceContext {
            containers,
            fs: Arc::clone(&ctx.fs),
            home,
            kubectl: ctx
                .env
                .get(KUBECTL_ENV)
                .cloned()
                .unwrap_or_else(|| "kubectl".to_string()),
            runtime_tx: runtime_tx.clone(),
        },
        events_tx.clone(),
        ctx.cancel.clone(),
    );

    let scheduler = Scheduler::new(
        Arc::clone(&graph),
        selected,
        SchedulerOptions {
            concurrency: options.concurrency,
            watch: options.watch,
        },
    );

    info!(
        tasks = graph.nodes.len(),
        services = graph.services.len(),
        concurrency = options.concurrency,
        watch = options.watch,
        cache = options.cache_enabled,
        "starting run"
    );

    let summary = if options.watch {
        let watcher = NotifyWatchBackend::new(runtime_tx, vec![cache_dir])?;
        let runtime = Runtime::new(
            scheduler, runtime_rx, executor, services, watcher, events_tx, ctx.cancel,
        );
        tokio::spawn(runtime.run())
    } else {
        drop(runtime_tx);
        let runtime = Runtime::new(
            scheduler, runtime_rx, executor, services, NoopWatch, events_tx, ctx.cancel,
        );
        tokio::spawn(runtime.run())
    };

    Ok(RunHandle {
        events: events_rx,
        summary,
    })
}
