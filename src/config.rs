//! Service configuration loaded from an optional TOML file.
//!
//! Every field has a default so an empty (or absent) file yields a working setup;
//! command-line flags are applied on top by the binary.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::engine::layout::SelectionRule;
use crate::workspace::extract::DEFAULT_MAX_EXTRACTED_BYTES;
use crate::{PipelineError, PipelineResult};

/// Default upload limit: 5 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

/// When a finished job's workspace is kept on disk instead of removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionPolicy {
    #[default]
    Never,
    OnFailure,
    Always,
}

impl RetentionPolicy {
    pub fn retains(self, succeeded: bool) -> bool {
        match self {
            RetentionPolicy::Never => false,
            RetentionPolicy::OnFailure => !succeeded,
            RetentionPolicy::Always => true,
        }
    }
}

impl std::str::FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(RetentionPolicy::Never),
            "on-failure" => Ok(RetentionPolicy::OnFailure),
            "always" => Ok(RetentionPolicy::Always),
            other => Err(format!(
                "unknown retention policy '{other}' (expected never, on-failure or always)"
            )),
        }
    }
}

/// Locations of the external programs driven by the pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub nargo: String,
    pub bb: String,
    pub garaga: String,
    pub noir_profiler: String,
    /// Directories appended to `PATH` for every stage. `None` uses the platform defaults.
    pub extra_paths: Option<Vec<PathBuf>>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        ToolchainConfig {
            nargo: "nargo".to_string(),
            bb: "bb".to_string(),
            garaga: "/home/ubuntu/garaga-venv/bin/garaga".to_string(),
            noir_profiler: "noir-profiler".to_string(),
            extra_paths: None,
        }
    }
}

impl ToolchainConfig {
    /// Directories where nargo and bb are installed by their installers.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        if let Some(paths) = &self.extra_paths {
            return paths.clone();
        }
        default_search_paths()
    }
}

fn default_search_paths() -> Vec<PathBuf> {
    if cfg!(target_os = "macos") {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_default();
        vec![home.join(".nargo/bin"), home.join(".bb")]
    } else {
        vec![
            PathBuf::from("/home/ubuntu/.nargo/bin"),
            PathBuf::from("/home/ubuntu/.bb"),
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub listen: SocketAddr,
    /// Dedicated listener for the log WebSocket. The main listener serves `/ws/` as well.
    pub ws_listen: Option<SocketAddr>,
    pub uploads_dir: PathBuf,
    pub max_upload_bytes: usize,
    /// Total size an upload may expand to when extracted.
    pub max_extracted_bytes: u64,
    /// Per-stage timeout in seconds; 0 disables it.
    pub stage_timeout_secs: u64,
    pub retain_workspaces: RetentionPolicy,
    pub artifact_selection: SelectionRule,
    pub toolchain: ToolchainConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            ws_listen: Some(SocketAddr::from(([0, 0, 0, 0], 8082))),
            uploads_dir: PathBuf::from("uploads"),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_extracted_bytes: DEFAULT_MAX_EXTRACTED_BYTES,
            stage_timeout_secs: 600,
            retain_workspaces: RetentionPolicy::default(),
            artifact_selection: SelectionRule::default(),
            toolchain: ToolchainConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn stage_timeout(&self) -> Option<Duration> {
        if self.stage_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.stage_timeout_secs))
        }
    }
}

pub fn load_config(path: &Path) -> PipelineResult<ServiceConfig> {
    let s = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::Message(format!("failed to read config {}: {e}", path.display()))
    })?;
    parse_config(&s)
}

pub fn parse_config(s: &str) -> PipelineResult<ServiceConfig> {
    toml::from_str(s).map_err(|e| PipelineError::Message(format!("invalid config: {e}")))
}
