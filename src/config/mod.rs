// src/config/mod.rs

//! Build file loading and validation.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load the root build file and everything it includes (`loader.rs`).
//! - Check per-file schema rules (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_build_files, parse_build_file, BuildFileSet, LoadedFile, DEFAULT_BUILD_FILE};
pub use model::{
    parse_duration, BuildFile, CommandConfig, GenerateConfig, HealthcheckConfig, SelectorConfig,
    ServiceConfig, TaskConfig,
};
pub use validate::validate_build_file;
