pub mod builders;
pub mod fake_containers;
pub mod fake_executor;

use std::path::Path;
use std::sync::{Arc, Once};

use tracing_subscriber::{fmt, EnvFilter};

use taskrig::config::{BuildFile, BuildFileSet, LoadedFile};
use taskrig::dag::{build_work_graph, Selection, WorkGraph};
use taskrig::errors::SpecError;
use taskrig::resolve::{resolve_references, ReferencedContext};
use taskrig::types::EnvMap;

pub use builders::{BuildFileBuilder, ServiceConfigBuilder, TaskConfigBuilder};
pub use fake_containers::FakeContainerRuntime;
pub use fake_executor::{FakeExecutor, FakeServices, ManualWatch, Script};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

/// A build file set with a single root file located in `dir`, skipping the
/// filesystem entirely.
pub fn single_file_set(dir: &Path, file: BuildFile) -> BuildFileSet {
    let root = dir.join(taskrig::config::DEFAULT_BUILD_FILE);
    let loaded = LoadedFile {
        path: root.clone(),
        dir: dir.to_path_buf(),
        file,
        includes: Default::default(),
        references: Default::default(),
    };
    BuildFileSet {
        root: root.clone(),
        files: [(root, loaded)].into(),
    }
}

/// Resolve a single in-memory build file.
pub fn resolve_single(
    dir: &Path,
    file: BuildFile,
    env: &EnvMap,
) -> Result<ReferencedContext, SpecError> {
    resolve_references(&single_file_set(dir, file), env)
}

/// Resolve and build the work graph of a single in-memory build file.
pub fn graph_for(dir: &Path, file: BuildFile, selection: &Selection) -> Arc<WorkGraph> {
    let ctx = resolve_single(dir, file, &EnvMap::new()).expect("build file resolves");
    Arc::new(build_work_graph(&ctx, selection).expect("work graph builds"))
}

/// Node id of the task or service with `key`.
pub fn id_of(graph: &WorkGraph, key: &str) -> String {
    graph
        .id_of(key)
        .unwrap_or_else(|| panic!("no node for key {key}"))
        .clone()
}
