// tests/graph_builder.rs

mod common;
use crate::common::{
    graph_for, id_of, resolve_single, BuildFileBuilder, ServiceConfigBuilder, TaskConfigBuilder,
};

use std::path::{Path, PathBuf};

use taskrig::dag::{build_work_graph, volume_name, ExecutionMode, Selection, ServiceMode};
use taskrig::errors::SpecError;
use taskrig::types::{EnvMap, Labels};

#[test]
fn identical_definitions_share_one_node() {
    let file = BuildFileBuilder::new()
        .with_task("a", TaskConfigBuilder::new("make all").label("x", "1").build())
        .with_task("b", TaskConfigBuilder::new("make all").label("x", "2").build())
        .with_task("c", TaskConfigBuilder::new("make other").build())
        .build();

    let graph = graph_for(Path::new("/p"), file, &Selection::All);
    assert_eq!(graph.nodes.len(), 2);
    assert_eq!(id_of(&graph, "a"), id_of(&graph, "b"));
    assert_ne!(id_of(&graph, "a"), id_of(&graph, "c"));
    // The shared node is selected once.
    assert_eq!(graph.selected.len(), 2);
}

#[test]
fn commands_are_substituted_and_placed() {
    let file = BuildFileBuilder::new()
        .with_env("OUT", "dist")
        .with_task(
            "build",
            TaskConfigBuilder::new("tsc --outDir $OUT")
                .cmd_in("ls ${OUT}", "web/$OUT")
                .build(),
        )
        .build();

    let graph = graph_for(Path::new("/p"), file, &Selection::All);
    let node = graph.node(&id_of(&graph, "build")).unwrap();
    assert_eq!(node.cmds[0].cmd, "tsc --outDir dist");
    assert_eq!(node.cmds[0].cwd, PathBuf::from("/p"));
    assert_eq!(node.cmds[1].cmd, "ls dist");
    assert_eq!(node.cmds[1].cwd, PathBuf::from("/p/web/dist"));
}

#[test]
fn container_tasks_inherit_dependency_outputs() {
    let file = BuildFileBuilder::new()
        .with_task(
            "compile",
            TaskConfigBuilder::new("make")
                .generates("dist")
                .generates("report.json")
                .build(),
        )
        .with_task(
            "package",
            TaskConfigBuilder::new("tar czf out.tgz dist")
                .image("alpine:3")
                .dep("compile")
                .build(),
        )
        .build();

    let graph = graph_for(Path::new("/p"), file, &Selection::Names(vec!["package".into()]));
    let node = graph.node(&id_of(&graph, "package")).unwrap();

    let inherited: Vec<(&Path, bool)> = node
        .generates
        .iter()
        .filter(|g| g.inherited)
        .map(|g| (g.path.as_path(), g.is_file))
        .collect();
    assert_eq!(
        inherited,
        [(Path::new("/p/dist"), false), (Path::new("/p/report.json"), true)]
    );

    let ExecutionMode::Container(settings) = &node.mode else {
        panic!("package should be a container task");
    };
    assert_eq!(settings.inherited_volumes.len(), 1);
    assert_eq!(settings.inherited_volumes[0].name, volume_name(Path::new("/p/dist")));
    assert_eq!(settings.inherited_volumes[0].container, "/p/dist");
    assert_eq!(settings.inherited_mounts[0].local, PathBuf::from("/p/report.json"));
}

#[test]
fn container_services_inherit_dependency_outputs() {
    let file = BuildFileBuilder::new()
        .with_task(
            "migrations",
            TaskConfigBuilder::new("make sql")
                .generates("migrations")
                .generates("schema.sql")
                .build(),
        )
        .with_service(
            "db",
            ServiceConfigBuilder::image("postgres:16").dep("migrations").build(),
        )
        .with_task("test", TaskConfigBuilder::new("cargo test").need("db").build())
        .build();

    let graph = graph_for(Path::new("/p"), file, &Selection::All);
    let service = &graph.services[&id_of(&graph, "db")];

    let ServiceMode::Container {
        inherited_volumes,
        inherited_mounts,
        ..
    } = &service.mode
    else {
        panic!("db should be a container service");
    };
    assert_eq!(inherited_volumes.len(), 1);
    assert_eq!(inherited_volumes[0].name, volume_name(Path::new("/p/migrations")));
    assert_eq!(inherited_volumes[0].container, "/p/migrations");
    assert_eq!(inherited_mounts.len(), 1);
    assert_eq!(inherited_mounts[0].local, PathBuf::from("/p/schema.sql"));

    // The same service without the dependency is a different service.
    let bare = BuildFileBuilder::new()
        .with_service("db", ServiceConfigBuilder::image("postgres:16").build())
        .with_task("test", TaskConfigBuilder::new("cargo test").need("db").build())
        .build();
    let bare = graph_for(Path::new("/p"), bare, &Selection::All);
    assert_ne!(id_of(&bare, "db"), id_of(&graph, "db"));
}

#[test]
fn selection_pulls_in_dependencies_and_services() {
    let file = BuildFileBuilder::new()
        .with_service("db", ServiceConfigBuilder::image("postgres:16").build())
        .with_task("migrate", TaskConfigBuilder::new("migrate up").need("db").build())
        .with_task("test", TaskConfigBuilder::new("cargo test").dep("migrate").build())
        .with_task("docs", TaskConfigBuilder::new("mdbook build").build())
        .build();

    let graph = graph_for(Path::new("/p"), file, &Selection::Names(vec!["test".into()]));
    assert_eq!(graph.nodes.len(), 2);
    assert_eq!(graph.services.len(), 1);
    assert!(graph.id_of("docs").is_none());
    assert_eq!(graph.selected, [id_of(&graph, "test")]);

    let migrate = graph.node(&id_of(&graph, "migrate")).unwrap();
    assert_eq!(migrate.needs, [id_of(&graph, "db")]);
}

#[test]
fn label_selection() {
    let file = BuildFileBuilder::new()
        .with_task("web", TaskConfigBuilder::new("npm test").label("team", "web").build())
        .with_task("api", TaskConfigBuilder::new("go test").label("team", "api").build())
        .build();

    let filter: Labels = [("team".to_string(), "api".to_string())].into();
    let selection = Selection::Labels(filter);
    let graph = graph_for(Path::new("/p"), file, &selection);

    assert_eq!(graph.selected, [id_of(&graph, "api")]);
    assert_eq!(graph.select(&selection).unwrap(), [id_of(&graph, "api")]);
}

#[test]
fn unknown_selected_task_is_not_found() {
    let file = BuildFileBuilder::new()
        .with_task("a", TaskConfigBuilder::new("echo a").build())
        .build();
    let ctx = resolve_single(Path::new("/p"), file, &EnvMap::new()).unwrap();

    let err = build_work_graph(&ctx, &Selection::Names(vec!["nope".into()])).unwrap_err();
    assert!(matches!(err, SpecError::NotFound { ref name, .. } if name == "nope"));

    let graph = build_work_graph(&ctx, &Selection::All).unwrap();
    assert!(graph.select(&Selection::Names(vec!["nope".into()])).is_err());
}

#[test]
fn describe_lists_dependencies_first() {
    let file = BuildFileBuilder::new()
        .with_task("deploy", TaskConfigBuilder::new("kubectl apply").dep("build").build())
        .with_task("build", TaskConfigBuilder::new("docker build .").image("docker:27").build())
        .build();

    let graph = graph_for(Path::new("/p"), file, &Selection::Names(vec!["deploy".into()]));
    let text = graph.describe();

    let build_at = text.find("build [container docker:27]").unwrap();
    let deploy_at = text.find("* deploy [local]").unwrap();
    assert!(build_at < deploy_at, "{text}");
    assert!(text.contains("deps: build"));
}
