// src/lib.rs

pub mod cache;
pub mod cli;
pub mod config;
pub mod container;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod resolve;
pub mod service;
pub mod types;
pub mod watch;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info, warn};

use crate::cli::CliArgs;
use crate::config::load_build_files;
use crate::dag::{build_work_graph, WorkGraph};
use crate::engine::{
    run_graph, CancelSignal, RunContext, RunEvent, RunOptions, RunSummary, ServiceState, TaskState,
};
use crate::fs::{FileSystem, RealFileSystem};
use crate::resolve::resolve_references;
use crate::types::{EnvMap, LogStream};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - build file loading and reference resolution
/// - work graph construction for the selected tasks
/// - the run itself (executor, services, optional watcher)
/// - Ctrl-C handling
///
/// Fails when the build files are invalid or the run did not complete every
/// selected task.
pub async fn run(args: CliArgs) -> Result<()> {
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let process_env: EnvMap = std::env::vars().collect();

    let cwd = std::env::current_dir().context("reading current directory")?;
    let root = cwd.join(&args.file);
    let files = load_build_files(fs.as_ref(), &root)?;
    let project_dir = files.root_file().dir.clone();
    debug!(root = %files.root.display(), files = files.files.len(), "loaded build files");

    let references = resolve_references(&files, &process_env)?;
    let selection = args.selection();
    let graph = Arc::new(build_work_graph(&references, &selection)?);

    if args.dry_run {
        print_dry_run(&graph, &project_dir);
        return Ok(());
    }
    if graph.selected.is_empty() {
        warn!("no tasks selected; nothing to do");
        return Ok(());
    }

    let mut options = RunOptions {
        watch: args.watch,
        cache_enabled: !args.no_cache,
        ..RunOptions::default()
    };
    if let Some(n) = args.concurrency {
        options.concurrency = n.max(1);
    }

    let cancel = CancelSignal::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            info!("interrupted; canceling run");
            cancel.cancel();
        });
    }

    let ctx = RunContext {
        cwd: project_dir,
        env: process_env,
        cancel,
        fs,
    };
    let mut handle = run_graph(graph, &selection, options, ctx)?;

    while let Some(event) = handle.events.recv().await {
        print_event(&event);
    }
    let summary = handle.summary.await.context("run task panicked")??;

    report(&summary);
    if !summary.success() {
        bail!("run failed");
    }
    Ok(())
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::Log {
            key, stream, line, ..
        } => match stream {
            LogStream::Stdout => println!("[{key}] {line}"),
            LogStream::Stderr | LogStream::System => eprintln!("[{key}] {line}"),
        },
        RunEvent::TaskState { key, state, .. } => match state {
            TaskState::Completed { .. } | TaskState::Running => info!(task = %key, "{state}"),
            TaskState::Error { .. } | TaskState::Crashed { .. } => error!(task = %key, "{state}"),
            TaskState::Canceled => warn!(task = %key, "{state}"),
            _ => debug!(task = %key, "{state}"),
        },
        RunEvent::ServiceState { key, state, .. } => match state {
            ServiceState::End { failure: Some(_) } => error!(service = %key, "{state}"),
            _ => info!(service = %key, "{state}"),
        },
    }
}

fn report(summary: &RunSummary) {
    for (key, state) in summary.failed() {
        eprintln!("  {key}: {state}");
    }
    let canceled: Vec<&str> = summary.canceled().map(String::as_str).collect();
    if !canceled.is_empty() {
        eprintln!("  canceled: {}", canceled.join(", "));
    }
    info!(
        tasks = summary.tasks.len(),
        success = summary.success(),
        "run finished"
    );
}

fn print_dry_run(graph: &WorkGraph, project_dir: &Path) {
    println!("taskrig dry-run ({})", project_dir.display());
    println!();
    print!("{}", graph.describe());
    debug!("dry-run complete (no execution)");
}
