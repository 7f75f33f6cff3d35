// src/cache/mod.rs

//! Node identity and incremental-rebuild manifests.

pub mod checksum;
pub mod identity;
pub mod manifest;

pub use identity::{canonical_json, node_identity, service_identity, sha1_hex};
pub use manifest::{CacheStore, Manifest};

/// Cache directory relative to the root build file's directory.
pub const DEFAULT_CACHE_DIR: &str = ".taskrig/cache";
