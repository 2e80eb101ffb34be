//! Per-project port registry and status heartbeat files.
//!
//! The bridge host records the port it listens on so that an out-of-process
//! client can find it without configuration. Layout under the registry
//! directory (`~/.unity-mcp` by default):
//!
//! ```text
//! unity-mcp-port-<hash>.json     {"unity_port", "project_path", "created_date"}
//! unity-mcp-status-<hash>.json   {"unity_port", "project_name", "reloading", "reason", "last_heartbeat"}
//! unity-mcp-port.json            legacy single-project file (read only)
//! ```
//!
//! `<hash>` is the hex encoding of the first 8 bytes of the SHA-256 of the
//! project path, so projects never overwrite each other's files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::client::probe_bridge;
use crate::constants::{DEFAULT_BRIDGE_PORT, DISCOVERY_PROBE_TIMEOUT, LEGACY_PORT_FILE, REGISTRY_DIR_NAME};

const PORT_FILE_PREFIX: &str = "unity-mcp-port-";
const STATUS_FILE_PREFIX: &str = "unity-mcp-status-";

/// Contents of a per-project port file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    /// Port the bridge host listens on.
    pub unity_port: u16,
    /// Project the host belongs to.
    #[serde(default)]
    pub project_path: String,
    /// When the record was written.
    #[serde(default = "Utc::now")]
    pub created_date: DateTime<Utc>,
}

/// Contents of a per-project status (heartbeat) file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Port the bridge host listens on.
    pub unity_port: u16,
    /// Display name of the project.
    #[serde(default)]
    pub project_name: String,
    /// Whether the editor is reloading and commands should be retried.
    #[serde(default)]
    pub reloading: bool,
    /// Free-form reason for the current status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Time of the last write.
    #[serde(default = "Utc::now")]
    pub last_heartbeat: DateTime<Utc>,
}

/// Registry directory handle.
#[derive(Debug, Clone)]
pub struct PortRegistry {
    dir: PathBuf,
}

impl PortRegistry {
    /// Registry rooted at an explicit directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Registry rooted at `~/.unity-mcp`.
    pub fn from_home() -> Result<Self> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(Self::new(home.join(REGISTRY_DIR_NAME)))
    }

    /// Directory holding the registry files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Hash used to key a project's files.
    pub fn project_hash(project_path: &str) -> String {
        let digest = Sha256::digest(project_path.as_bytes());
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Path of the port file for a project.
    pub fn port_file_path(&self, project_path: &str) -> PathBuf {
        self.dir
            .join(format!("{PORT_FILE_PREFIX}{}.json", Self::project_hash(project_path)))
    }

    /// Path of the status file for a project.
    pub fn status_file_path(&self, project_path: &str) -> PathBuf {
        self.dir
            .join(format!("{STATUS_FILE_PREFIX}{}.json", Self::project_hash(project_path)))
    }

    /// Record the port a project's bridge listens on.
    pub fn write_port(&self, project_path: &str, port: u16) -> Result<PathBuf> {
        let record = PortRecord {
            unity_port: port,
            project_path: project_path.to_string(),
            created_date: Utc::now(),
        };
        let path = self.port_file_path(project_path);
        self.write_json(&path, &record)?;
        log::debug!("[Registry] Wrote port {} to {}", port, path.display());
        Ok(path)
    }

    /// Write a heartbeat for a project.
    pub fn write_status(
        &self,
        project_path: &str,
        port: u16,
        reloading: bool,
        reason: Option<&str>,
    ) -> Result<PathBuf> {
        let record = StatusRecord {
            unity_port: port,
            project_name: project_name(project_path),
            reloading,
            reason: reason.map(str::to_string),
            last_heartbeat: Utc::now(),
        };
        let path = self.status_file_path(project_path);
        self.write_json(&path, &record)?;
        Ok(path)
    }

    /// Read the port file for a project, if it exists and parses.
    pub fn read_port(&self, project_path: &str) -> Option<PortRecord> {
        read_json(&self.port_file_path(project_path)).ok()
    }

    /// Most recently modified status file, if any parses.
    pub fn read_latest_status(&self) -> Option<StatusRecord> {
        let newest = self.files_newest_first(STATUS_FILE_PREFIX).into_iter().next()?;
        match read_json(&newest) {
            Ok(status) => Some(status),
            Err(e) => {
                log::warn!("[Registry] Could not read status {}: {e:#}", newest.display());
                None
            }
        }
    }

    /// Port files, newest first, with the legacy file (if present) last.
    pub fn candidate_port_files(&self) -> Vec<PathBuf> {
        let mut files = self.files_newest_first(PORT_FILE_PREFIX);
        let legacy = self.dir.join(LEGACY_PORT_FILE);
        if legacy.is_file() {
            files.push(legacy);
        }
        files
    }

    /// Find the port of a running bridge.
    ///
    /// Order: the newest status file if its port answers a ping; then the
    /// port files newest first, first responsive wins; otherwise the first
    /// port that parsed; otherwise the default port.
    pub async fn discover_port(&self) -> u16 {
        self.discover_port_with_timeout(DISCOVERY_PROBE_TIMEOUT).await
    }

    /// [`discover_port`](Self::discover_port) with an explicit probe timeout.
    pub async fn discover_port_with_timeout(&self, probe_timeout: Duration) -> u16 {
        if let Some(status) = self.read_latest_status() {
            if probe_bridge(status.unity_port, probe_timeout).await {
                log::info!("[Registry] Using port {} from status file", status.unity_port);
                return status.unity_port;
            }
        }

        let mut first_seen = None;
        for path in self.candidate_port_files() {
            let record: PortRecord = match read_json(&path) {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("[Registry] Could not read port registry {}: {e:#}", path.display());
                    continue;
                }
            };
            first_seen.get_or_insert(record.unity_port);
            if probe_bridge(record.unity_port, probe_timeout).await {
                log::info!(
                    "[Registry] Using port {} from {}",
                    record.unity_port,
                    path.file_name().map_or_else(String::new, |n| n.to_string_lossy().into_owned())
                );
                return record.unity_port;
            }
        }

        if let Some(port) = first_seen {
            log::info!("[Registry] No responsive port found; using first seen value {}", port);
            return port;
        }

        log::info!("[Registry] No port registry found; using default port {}", DEFAULT_BRIDGE_PORT);
        DEFAULT_BRIDGE_PORT
    }

    fn files_newest_first(&self, prefix: &str) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut files: Vec<(SystemTime, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.starts_with(prefix) && name.ends_with(".json")
            })
            .filter_map(|entry| {
                let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
                Some((modified, entry.path()))
            })
            .collect();

        files.sort_by(|a, b| b.0.cmp(&a.0));
        files.into_iter().map(|(_, path)| path).collect()
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create registry dir {}", self.dir.display()))?;

        // Write-then-rename so readers never see a half-written file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(value)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Last path component of a project path, used as its display name.
fn project_name(project_path: &str) -> String {
    Path::new(project_path.trim_end_matches(['/', '\\']))
        .file_name()
        .map_or_else(|| project_path.to_string(), |n| n.to_string_lossy().into_owned())
}
