// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::DEFAULT_BUILD_FILE;
use crate::dag::Selection;
use crate::types::Labels;

/// Command-line arguments for `taskrig`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "taskrig",
    version,
    about = "Run build tasks locally or in containers, with caching and services.",
    long_about = None
)]
pub struct CliArgs {
    /// Tasks to run. Without tasks or filters, every task of the root build
    /// file is selected.
    #[arg(value_name = "TASK")]
    pub tasks: Vec<String>,

    /// Path to the root build file, or a directory containing one.
    #[arg(long, short = 'f', value_name = "PATH", default_value = DEFAULT_BUILD_FILE)]
    pub file: PathBuf,

    /// Select tasks by label. Repeatable; every pair must match.
    #[arg(long, value_name = "KEY=VALUE", value_parser = parse_label)]
    pub filter: Vec<(String, String)>,

    /// Maximum number of tasks running at once (default: number of CPUs).
    #[arg(long, short = 'j', value_name = "N")]
    pub concurrency: Option<usize>,

    /// Keep running and re-run tasks whose sources change.
    #[arg(long, short = 'w')]
    pub watch: bool,

    /// Execute every task even if its cache manifest is up to date.
    #[arg(long)]
    pub no_cache: bool,

    /// Resolve and print the work graph, but don't execute any commands.
    #[arg(long)]
    pub dry_run: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TASKRIG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

impl CliArgs {
    /// Which tasks the run starts from. Explicit task names win over filters.
    pub fn selection(&self) -> Selection {
        if !self.tasks.is_empty() {
            Selection::Names(self.tasks.clone())
        } else if !self.filter.is_empty() {
            Selection::Labels(self.filter.iter().cloned().collect::<Labels>())
        } else {
            Selection::All
        }
    }
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty label key in '{s}'"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
