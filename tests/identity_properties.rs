// tests/identity_properties.rs

mod common;
use crate::common::{graph_for, id_of, BuildFileBuilder, TaskConfigBuilder};

use std::collections::BTreeSet;
use std::path::Path;

use proptest::prelude::*;

use taskrig::dag::Selection;

fn boxed_task(mounts: &[String], envs: &[(String, String)]) -> TaskConfigBuilder {
    let mut task = TaskConfigBuilder::new("npm test").image("node:20");
    for mount in mounts {
        task = task.mount(mount);
    }
    for (key, value) in envs {
        task = task.env(key, value);
    }
    task
}

fn id_with(task: TaskConfigBuilder) -> String {
    let file = BuildFileBuilder::new().with_task("t", task.build()).build();
    let graph = graph_for(Path::new("/p"), file, &Selection::All);
    id_of(&graph, "t")
}

fn mount_set() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set("[a-z]{1,8}", 1..6).prop_map(|names: BTreeSet<String>| {
        names
            .into_iter()
            .map(|n| format!("/host/{n}:/ctr/{n}"))
            .collect()
    })
}

proptest! {
    #[test]
    fn mount_order_does_not_change_identity(
        (mounts, shuffled) in mount_set().prop_flat_map(|m| (Just(m.clone()), Just(m).prop_shuffle()))
    ) {
        prop_assert_eq!(id_with(boxed_task(&mounts, &[])), id_with(boxed_task(&shuffled, &[])));
    }

    #[test]
    fn env_order_does_not_change_identity(
        (envs, shuffled) in prop::collection::btree_map("[A-Z]{1,6}", "[a-z0-9]{0,6}", 1..6)
            .prop_map(|m| m.into_iter().collect::<Vec<_>>())
            .prop_flat_map(|e| (Just(e.clone()), Just(e).prop_shuffle()))
    ) {
        prop_assert_eq!(id_with(boxed_task(&[], &envs)), id_with(boxed_task(&[], &shuffled)));
    }

    #[test]
    fn labels_do_not_change_identity(
        labels in prop::collection::btree_map("[a-z]{1,6}", "[a-z]{1,6}", 0..4)
    ) {
        let mut labelled = boxed_task(&[], &[]);
        for (key, value) in &labels {
            labelled = labelled.label(key, value);
        }
        prop_assert_eq!(id_with(labelled), id_with(boxed_task(&[], &[])));
    }

    #[test]
    fn identity_is_a_sha1_hex_digest(cmd in "[a-z][a-z ]{0,19}") {
        let id = id_with(TaskConfigBuilder::new(&cmd));
        prop_assert_eq!(id.len(), 40);
        prop_assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}

#[test]
fn command_order_changes_identity() {
    let forward = TaskConfigBuilder::new("make a").cmd("make b");
    let backward = TaskConfigBuilder::new("make b").cmd("make a");
    assert_ne!(id_with(forward), id_with(backward));
}

#[test]
fn image_changes_identity() {
    let node20 = TaskConfigBuilder::new("npm test").image("node:20");
    let node22 = TaskConfigBuilder::new("npm test").image("node:22");
    assert_ne!(id_with(node20), id_with(node22));
}
