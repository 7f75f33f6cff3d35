// tests/local_exec_cache.rs

mod common;
use crate::common::{init_tracing, log_lines, task_states, with_timeout};

use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use taskrig::config::load_build_files;
use taskrig::dag::{build_work_graph, Selection};
use taskrig::engine::{
    run_graph, CancelSignal, RunContext, RunEvent, RunOptions, RunSummary, TaskState,
};
use taskrig::fs::RealFileSystem;
use taskrig::resolve::resolve_references;
use taskrig::types::EnvMap;

const BUILD_FILE: &str = r#"
[tasks.A]
cmds = ["echo ran >> runs.log", "echo built"]
src = ["index.js"]
"#;

fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("taskrig.toml"), BUILD_FILE).unwrap();
    fs::write(dir.path().join("index.js"), "console.log('hi')\n").unwrap();
    dir
}

async fn run_once(dir: &Path, cache_enabled: bool) -> (RunSummary, Vec<RunEvent>) {
    let fs = Arc::new(RealFileSystem);
    let env: EnvMap = std::env::vars().collect();

    let files = load_build_files(fs.as_ref(), dir).unwrap();
    let ctx = resolve_references(&files, &env).unwrap();
    let graph = Arc::new(build_work_graph(&ctx, &Selection::All).unwrap());

    let options = RunOptions {
        concurrency: 2,
        watch: false,
        cache_enabled,
        cache_dir: None,
    };
    let run_ctx = RunContext {
        cwd: dir.to_path_buf(),
        env,
        cancel: CancelSignal::new(),
        fs,
    };
    let mut handle = run_graph(graph, &Selection::All, options, run_ctx).unwrap();

    with_timeout(async move {
        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            events.push(event);
        }
        let summary = handle.summary.await.unwrap().unwrap();
        (summary, events)
    })
    .await
}

fn runs(dir: &Path) -> usize {
    fs::read_to_string(dir.join("runs.log"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

fn completed_cached(summary: &RunSummary) -> Option<bool> {
    match &summary.tasks["A"] {
        TaskState::Completed { cached, .. } => Some(*cached),
        _ => None,
    }
}

#[tokio::test]
async fn unchanged_sources_skip_the_second_run() {
    init_tracing();
    let dir = project();

    let (first, events) = run_once(dir.path(), true).await;
    assert!(first.success());
    assert_eq!(completed_cached(&first), Some(false));
    assert_eq!(log_lines(&events, "A"), ["built"]);
    assert!(dir.path().join(".taskrig/cache").is_dir());

    let (second, events) = run_once(dir.path(), true).await;
    assert!(second.success());
    assert_eq!(completed_cached(&second), Some(true));
    assert_eq!(runs(dir.path()), 1);

    // A cache hit goes through `ready` but never `running`.
    let states = task_states(&events, "A");
    assert!(!states.contains(&TaskState::Running), "{states:?}");
}

#[tokio::test]
async fn touched_source_runs_again() {
    init_tracing();
    let dir = project();

    run_once(dir.path(), true).await;

    let later = SystemTime::now() + Duration::from_secs(60);
    File::options()
        .write(true)
        .open(dir.path().join("index.js"))
        .unwrap()
        .set_modified(later)
        .unwrap();

    let (summary, _) = run_once(dir.path(), true).await;
    assert_eq!(completed_cached(&summary), Some(false));
    assert_eq!(runs(dir.path()), 2);
}

#[tokio::test]
async fn disabled_cache_always_executes() {
    init_tracing();
    let dir = project();

    run_once(dir.path(), false).await;
    let (summary, _) = run_once(dir.path(), false).await;

    assert_eq!(completed_cached(&summary), Some(false));
    assert_eq!(runs(dir.path()), 2);
}

#[tokio::test]
async fn failing_command_crashes_and_invalidates() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("taskrig.toml"),
        r#"
        [tasks.A]
        cmds = ["echo ran >> runs.log", "exit 4"]
        src = ["index.js"]
        "#,
    )
    .unwrap();
    fs::write(dir.path().join("index.js"), "x").unwrap();

    let (first, events) = run_once(dir.path(), true).await;
    assert_eq!(first.tasks["A"], TaskState::Crashed { exit_code: 4 });
    assert!(log_lines(&events, "A").contains(&"failed with code 4".to_string()));

    let (second, _) = run_once(dir.path(), true).await;
    assert_eq!(second.tasks["A"], TaskState::Crashed { exit_code: 4 });
    assert_eq!(runs(dir.path()), 2);
}

#[tokio::test]
async fn project_root_source_ignores_the_cache_dir() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("taskrig.toml"),
        r#"
        [tasks.A]
        cmds = ["echo ran >> runs.log"]
        src = ["."]
        "#,
    )
    .unwrap();
    fs::write(dir.path().join("index.js"), "x").unwrap();

    let (first, _) = run_once(dir.path(), true).await;
    assert_eq!(completed_cached(&first), Some(false));

    // The manifest written by each run lives below the source root.
    for _ in 0..2 {
        let (summary, _) = run_once(dir.path(), true).await;
        assert_eq!(completed_cached(&summary), Some(true));
    }
    assert_eq!(runs(dir.path()), 1);

    let manifest = fs::read_dir(dir.path().join(".taskrig/cache"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let recorded = fs::read_to_string(manifest).unwrap();
    assert!(!recorded.contains(".taskrig"), "{recorded}");
    assert!(recorded.contains("index.js="), "{recorded}");
}
