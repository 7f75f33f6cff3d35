// src/container/user.rs

use std::fmt;

use tokio::process::Command;
use tracing::debug;

/// Numeric user and group of the invoking host user. Files created inside
/// containers are handed back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostUser {
    pub uid: u32,
    pub gid: u32,
}

impl fmt::Display for HostUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

impl HostUser {
    /// Ask `id` for the current uid/gid. `None` where that is not possible
    /// (non-unix hosts, restricted environments).
    pub async fn detect() -> Option<Self> {
        let uid = id_value("-u").await?;
        let gid = id_value("-g").await?;
        Some(Self { uid, gid })
    }
}

async fn id_value(flag: &str) -> Option<u32> {
    let out = Command::new("id").arg(flag).output().await.ok()?;
    if !out.status.success() {
        debug!(flag, "id command failed");
        return None;
    }
    String::from_utf8_lossy(&out.stdout).trim().parse().ok()
}
