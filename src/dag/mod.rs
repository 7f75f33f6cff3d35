// src/dag/mod.rs

//! Work graph construction.
//!
//! - [`work`] holds the execution-ready node/service types and the graph.
//! - [`builder`] turns resolved references into a deduplicated graph.
//! - [`matcher`] compiles `src` entries into path matchers.
//! - [`template`] performs `$VAR` substitution on string fields.

pub mod builder;
pub mod matcher;
pub mod template;
pub mod work;

pub use builder::{build_work_graph, volume_name, Selection, VOLUME_PREFIX};
pub use matcher::{MatcherKind, SourceMatcher};
pub use template::substitute;
pub use work::{
    ContainerSettings, ExecutionMode, GeneratedArtifact, ServiceMode, WorkCommand, WorkGraph,
    WorkMount, WorkNode, WorkService, WorkVolume,
};
