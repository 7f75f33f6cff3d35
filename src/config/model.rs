// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::types::CacheMode;

/// One build file as read from TOML.
///
/// ```toml
/// [envs]
/// NODE_ENV = "production"
///
/// [includes]
/// shared = "shared/taskrig.toml"
///
/// [tasks.build]
/// cmds = ["npm ci", "npm run build"]
/// src = ["src/**/*.ts"]
/// deps = ["shared:lint"]
/// ```
///
/// All sections are optional. A file without tasks is valid (it may only
/// exist to be included somewhere else).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct BuildFile {
    /// Environment shared by every task in this file.
    #[serde(default)]
    pub envs: BTreeMap<String, String>,

    /// Alias -> path. Included tasks run in the including file's directory.
    #[serde(default)]
    pub includes: BTreeMap<String, String>,

    /// Alias -> path. Referenced tasks run in the referenced file's directory.
    #[serde(default)]
    pub references: BTreeMap<String, String>,

    #[serde(default)]
    pub tasks: BTreeMap<String, TaskConfig>,

    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

/// `[tasks.<name>]` section.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    #[serde(default)]
    pub description: Option<String>,

    /// Container image. Presence turns the task into a container task.
    #[serde(default)]
    pub image: Option<String>,

    /// Shell used to run each command (default `sh`).
    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default)]
    pub cmds: Vec<CommandConfig>,

    #[serde(default)]
    pub src: Vec<String>,

    #[serde(default)]
    pub generates: Vec<GenerateConfig>,

    /// Task names that must complete first.
    #[serde(default)]
    pub deps: Vec<String>,

    /// Service names that must be ready first.
    #[serde(default)]
    pub needs: Vec<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub cache: Option<CacheMode>,

    /// Name of a base task whose definition is merged into this one.
    #[serde(default)]
    pub extend: Option<String>,

    /// `local:container` bind mounts.
    #[serde(default)]
    pub mounts: Vec<String>,

    /// `name:container` named volumes.
    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(default)]
    pub ports: Vec<String>,

    #[serde(default)]
    pub envs: BTreeMap<String, String>,

    #[serde(default)]
    pub platform: Option<String>,
}

/// A command line, optionally with its own working directory.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandConfig {
    Plain(String),
    Detailed {
        cmd: String,
        #[serde(default)]
        path: Option<String>,
    },
}

impl CommandConfig {
    pub fn cmd(&self) -> &str {
        match self {
            CommandConfig::Plain(cmd) => cmd,
            CommandConfig::Detailed { cmd, .. } => cmd,
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            CommandConfig::Plain(_) => None,
            CommandConfig::Detailed { path, .. } => path.as_deref(),
        }
    }
}

/// A generated artifact. Plain strings are classified as file or directory
/// later, from the path itself.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum GenerateConfig {
    Path(String),
    Detailed {
        path: String,
        #[serde(default)]
        file: Option<bool>,
    },
}

impl GenerateConfig {
    pub fn path(&self) -> &str {
        match self {
            GenerateConfig::Path(path) => path,
            GenerateConfig::Detailed { path, .. } => path,
        }
    }

    pub fn is_file(&self) -> Option<bool> {
        match self {
            GenerateConfig::Path(_) => None,
            GenerateConfig::Detailed { file, .. } => *file,
        }
    }
}

/// `[services.<name>]` section.
///
/// Exactly one of `image` (container service) or `context` + `selector`
/// (kubernetes port-forward) must be set.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub image: Option<String>,

    /// kubectl context name.
    #[serde(default)]
    pub context: Option<String>,

    #[serde(default)]
    pub selector: Option<SelectorConfig>,

    #[serde(default)]
    pub ports: Vec<String>,

    #[serde(default)]
    pub envs: BTreeMap<String, String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub healthcheck: Option<HealthcheckConfig>,

    #[serde(default)]
    pub deps: Vec<String>,

    #[serde(default)]
    pub needs: Vec<String>,

    #[serde(default)]
    pub mounts: Vec<String>,

    #[serde(default)]
    pub volumes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SelectorConfig {
    /// Resource kind: `deployment`, `pod`, `service`...
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HealthcheckConfig {
    pub cmd: String,

    /// Delay between attempts (default `1s`).
    #[serde(default)]
    pub interval: Option<String>,

    /// Upper bound for a single attempt (default `5s`).
    #[serde(default)]
    pub timeout: Option<String>,

    /// Number of failed attempts before giving up. Unlimited when unset.
    #[serde(default)]
    pub retries: Option<u32>,
}

/// Parse a simple duration string like "3s", "250ms", "1m", "2h".
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
