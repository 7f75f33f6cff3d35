// src/exec/mod.rs

//! Execution layer.
//!
//! - [`backend`] provides the `ExecutorBackend` trait and the production
//!   `RealExecutorBackend`, which tests replace with a fake.
//! - [`task_runner`] runs one attempt of a node: cache check, execution,
//!   manifest refresh, outcome.
//! - [`local`] runs commands as host processes.
//! - [`container`] runs commands inside a throwaway container.
//! - [`mounts`] resolves the volumes a container task sees.

pub mod backend;
pub mod container;
pub mod local;
pub mod mounts;
pub mod task_runner;

pub use backend::{ExecutorBackend, RealExecutorBackend};
pub use task_runner::ExecContext;
