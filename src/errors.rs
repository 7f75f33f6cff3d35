// src/errors.rs

//! Crate-wide error types.
//!
//! Each layer has its own enum so callers can tell a broken build file
//! (`SpecError`, fatal before anything runs) from a failing command
//! (`ExecError`, terminal for one node only).

use thiserror::Error;

/// Invalid or unresolvable build specification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("{kind} '{name}' not found (referenced from {from})")]
    NotFound {
        kind: &'static str,
        name: String,
        from: String,
    },

    #[error("'{name}' in needs of {from} is a task; only services can be needed")]
    NeedsTask { name: String, from: String },

    #[error("missing environment variable '{var}' required by {from}")]
    MissingEnv { var: String, from: String },

    #[error("duplicate alias '{alias}' in {file}")]
    DuplicateAlias { alias: String, file: String },

    #[error("cycle detected in {kind}: {}", path.join(" -> "))]
    Cycle { kind: &'static str, path: Vec<String> },

    #[error("invalid definition for '{name}': {reason}")]
    InvalidTask { name: String, reason: String },

    #[error("failed to load build file {path}: {reason}")]
    Load { path: String, reason: String },
}

/// Cache manifest failures. Never surfaced as a run failure; callers treat
/// them as a cache miss.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache manifest I/O at {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("malformed cache manifest {path} at line {line}")]
    Malformed { path: String, line: usize },
}

/// Failures of the container runtime collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContainerError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("failed to pull image {image}: {reason}")]
    Pull { image: String, reason: String },

    #[error("failed to create container from {image}: {reason}")]
    Create { image: String, reason: String },

    #[error("failed to start container {id}: {reason}")]
    Start { id: String, reason: String },

    #[error("exec in container {id} failed: {reason}")]
    Exec { id: String, reason: String },

    #[error("failed to inspect container {id}: {reason}")]
    Inspect { id: String, reason: String },

    #[error("failed to remove container {id}: {reason}")]
    Remove { id: String, reason: String },
}

/// Why running a node's commands did not succeed.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed with code {code}")]
    Crashed { code: i64 },

    #[error("terminated without an exit code")]
    Killed,

    #[error("failed to spawn '{cmd}': {reason}")]
    Spawn { cmd: String, reason: String },

    #[error("invalid mount '{mount}': {reason}")]
    InvalidMount { mount: String, reason: String },

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("canceled")]
    Canceled,
}

/// Programming errors in state handling. These abort the run instead of
/// being ignored.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("{node} already resolved as {state}")]
    AlreadyResolved { node: String, state: String },

    #[error("invalid transition for {node}: {from} -> {to}")]
    InvalidTransition {
        node: String,
        from: String,
        to: String,
    },

    #[error("unknown node {0}")]
    UnknownNode(String),
}

#[derive(Error, Debug)]
pub enum TaskrigError {
    #[error("Specification error: {0}")]
    Spec(#[from] SpecError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, TaskrigError>;
