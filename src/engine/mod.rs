// src/engine/mod.rs

//! Orchestration engine for taskrig.
//!
//! This module ties together:
//! - the pure scheduling core ([`scheduler`]), which owns every task and
//!   service state and decides what runs next
//! - the async runtime shell ([`runtime`]) that feeds it events from
//!   executors, services and the file watcher and carries out its commands
//! - the run entry point ([`run`]) wiring the production backends
//!
//! State types live in [`state`], the events exchanged between the layers in
//! [`events`] and run-wide cancellation in [`cancel`].

pub mod cancel;
pub mod events;
pub mod run;
pub mod runtime;
pub mod scheduler;
pub mod state;

pub use cancel::CancelSignal;
pub use events::{RunEvent, RuntimeEvent, StatusSink, TaskOutcome, TaskPhase};
pub use run::{run_graph, RunContext, RunHandle, RunOptions};
pub use runtime::{Runtime, CANCEL_GRACE};
pub use scheduler::{CoreCommand, RunSummary, Scheduler, SchedulerOptions, SchedulerStep};
pub use state::{ServiceState, TaskState};
