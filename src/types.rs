use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Fully qualified name of a task or service (`prefix:name`, prefix empty at
/// the root build file).
pub type TaskKey = String;

/// Canonical identity of a work node or service (40 hex chars, SHA-1).
pub type NodeId = String;

/// Environment map after `$` markers and build-file layering were applied.
pub type EnvMap = BTreeMap<String, String>;

/// Free-form `key = value` labels used for selection.
pub type Labels = BTreeMap<String, String>;

/// How a task decides whether its previous execution can be reused.
///
/// - `ModifyDate`: compare source modification times against the manifest
///   recorded after the last successful run (default).
/// - `Checksum`: same manifest layout, but recording a content digest, so a
///   touched-but-unchanged file is still a hit.
/// - `None`: never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    #[default]
    ModifyDate,
    Checksum,
    None,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::ModifyDate => "modify-date",
            CacheMode::Checksum => "checksum",
            CacheMode::None => "none",
        }
    }
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "modify-date" | "modify_date" => Ok(CacheMode::ModifyDate),
            "checksum" => Ok(CacheMode::Checksum),
            "none" => Ok(CacheMode::None),
            other => Err(format!(
                "invalid cache mode: {other} (expected \"modify-date\", \"checksum\" or \"none\")"
            )),
        }
    }
}

/// Which output stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Messages emitted by taskrig itself on behalf of a node.
    System,
}
