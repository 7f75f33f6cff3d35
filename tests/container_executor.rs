// tests/container_executor.rs

mod common;
use crate::common::{
    graph_for, id_of, log_lines, with_timeout, BuildFileBuilder, FakeContainerRuntime,
    TaskConfigBuilder,
};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use taskrig::container::{HostUser, VolumeBinding, NODE_LABEL};
use taskrig::dag::{ExecutionMode, Selection, WorkNode};
use taskrig::engine::{CancelSignal, RunEvent, StatusSink};
use taskrig::errors::ExecError;
use taskrig::exec::container::{run_container, ContainerEnv};
use taskrig::fs::mock::MockFileSystem;

fn boxed(task: TaskConfigBuilder) -> Arc<WorkNode> {
    let file = BuildFileBuilder::new().with_task("t", task.build()).build();
    let graph = graph_for(Path::new("/p"), file, &Selection::All);
    Arc::clone(graph.node(&id_of(&graph, "t")).unwrap())
}

async fn run(
    node: &WorkNode,
    runtime: &FakeContainerRuntime,
    fs: &MockFileSystem,
    host_user: Option<HostUser>,
) -> (Result<(), ExecError>, Vec<RunEvent>) {
    let ExecutionMode::Container(settings) = &node.mode else {
        panic!("{} is not a container task", node.key);
    };
    let (tx, mut rx) = mpsc::channel(64);
    let sink = StatusSink::new(node.id.clone(), node.key.clone(), tx);
    let env = ContainerEnv {
        runtime,
        fs,
        home: Some(Path::new("/home/me")),
        host_user,
    };

    let result = run_container(node, settings, env, &sink, &CancelSignal::new()).await;
    drop(sink);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (result, events)
}

#[tokio::test]
async fn commands_run_in_one_container_that_is_removed() {
    let node = boxed(
        TaskConfigBuilder::new("npm ci")
            .cmd_in("npm run build", "web")
            .image("node:20")
            .env("CI", "1"),
    );
    let runtime = FakeContainerRuntime::new().with_image("node:20");
    let fs = MockFileSystem::new();

    let (result, events) = run(&node, &runtime, &fs, None).await;
    result.unwrap();

    let created = runtime.created();
    assert_eq!(created.len(), 1);
    let spec = &created[0];
    assert_eq!(spec.image, "node:20");
    assert_eq!(spec.entrypoint.as_deref(), Some("sh"));
    assert!(spec.interactive);
    assert_eq!(spec.workdir.as_deref(), Some("/p"));
    assert_eq!(spec.labels[NODE_LABEL], node.id);
    assert_eq!(spec.env["CI"], "1");

    let execs = runtime.execs();
    let cmds: Vec<(&str, Option<&str>)> = execs
        .iter()
        .map(|(_, e)| (e.cmd[2].as_str(), e.workdir.as_deref()))
        .collect();
    assert_eq!(
        cmds,
        [("npm ci", Some("/p")), ("npm run build", Some("/p/web"))]
    );
    assert!(execs.iter().all(|(id, e)| id == "c1" && e.cmd[..2] == ["sh", "-c"]));

    assert_eq!(runtime.removed(), ["c1"]);
    assert!(runtime.pulled().is_empty());
    assert_eq!(log_lines(&events, "t"), ["npm ci", "npm run build"]);
}

#[tokio::test]
async fn missing_image_is_pulled_first() {
    let node = boxed(TaskConfigBuilder::new("echo hi").image("alpine"));
    let runtime = FakeContainerRuntime::new();
    let fs = MockFileSystem::new();

    let (result, _) = run(&node, &runtime, &fs, None).await;
    result.unwrap();
    assert_eq!(runtime.pulled(), ["alpine:latest"]);
}

#[tokio::test]
async fn non_zero_exit_crashes_and_still_removes() {
    let node = boxed(
        TaskConfigBuilder::new("make test")
            .cmd("make deploy")
            .image("alpine:3"),
    );
    let runtime = FakeContainerRuntime::new()
        .with_image("alpine:3")
        .exit_code("make test", 2);
    let fs = MockFileSystem::new();

    let (result, _) = run(&node, &runtime, &fs, None).await;
    assert!(matches!(result, Err(ExecError::Crashed { code: 2 })));
    assert_eq!(runtime.execs().len(), 1);
    assert_eq!(runtime.removed(), ["c1"]);
}

#[tokio::test]
async fn sources_mounts_and_outputs_are_bound() {
    let node = boxed(
        TaskConfigBuilder::new("tsc")
            .image("node:20")
            .src("src/**/*.ts")
            .mount("~/.npmrc:/root/.npmrc")
            .volume("npm:/root/.npm")
            .generates("dist"),
    );
    let runtime = FakeContainerRuntime::new().with_image("node:20");
    let fs = MockFileSystem::new();
    fs.add_file("/p/src/main.ts", "export {}");

    let (result, _) = run(&node, &runtime, &fs, None).await;
    result.unwrap();

    let binds: Vec<String> = runtime.created()[0]
        .binds
        .iter()
        .map(VolumeBinding::to_arg)
        .collect();
    assert_eq!(binds[0], "/p/src:/p/src");
    assert_eq!(binds[1], "/home/me/.npmrc:/root/.npmrc");
    assert_eq!(binds[2], "npm:/root/.npm");
    assert!(binds[3].ends_with(":/p/dist"), "{binds:?}");
}

#[tokio::test]
async fn outputs_are_handed_to_the_host_user() {
    let node = boxed(TaskConfigBuilder::new("make").image("alpine:3").generates("out"));
    let runtime = FakeContainerRuntime::new().with_image("alpine:3");
    let fs = MockFileSystem::new();
    let user = HostUser { uid: 1000, gid: 1000 };

    let (result, _) = run(&node, &runtime, &fs, Some(user)).await;
    result.unwrap();

    let execs = runtime.execs();
    let (_, chown) = &execs[0];
    assert_eq!(chown.user.as_deref(), Some("0"));
    assert_eq!(chown.cmd[..4], ["chown", "-R", "1000:1000", "/p"]);
    assert!(chown.cmd.contains(&"/p/out".to_string()));
    assert_eq!(execs[1].1.cmd[2], "make");
}

#[tokio::test]
async fn cancellation_mid_command_removes_the_container() {
    let node = boxed(
        TaskConfigBuilder::new("npm run serve")
            .cmd("npm run report")
            .image("node:20"),
    );
    let ExecutionMode::Container(settings) = &node.mode else {
        panic!("not a container task");
    };
    let runtime = FakeContainerRuntime::new()
        .with_image("node:20")
        .hangs_on("serve");
    let fs = MockFileSystem::new();
    let cancel = CancelSignal::new();

    let (tx, _rx) = mpsc::channel(64);
    let sink = StatusSink::new(node.id.clone(), node.key.clone(), tx);
    let env = ContainerEnv {
        runtime: &runtime,
        fs: &fs,
        home: None,
        host_user: None,
    };

    let interrupt = async {
        while runtime.execs().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
    };
    let (result, ()) = with_timeout(async {
        tokio::join!(run_container(&node, settings, env, &sink, &cancel), interrupt)
    })
    .await;

    assert!(matches!(result, Err(ExecError::Canceled)), "{result:?}");
    assert_eq!(runtime.execs().len(), 1);
    assert_eq!(runtime.removed(), ["c1"]);
}
