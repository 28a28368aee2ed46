pub mod config;
pub mod engine;
pub mod logging;
pub mod package;
pub mod run_cmd;
pub mod serve_cmd;
pub mod server;
pub mod service;
pub mod workspace;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No file provided")]
    UploadMissing,
    #[error("Uploaded file is too large (max {limit} bytes).")]
    PayloadTooLarge { limit: usize },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("a job for requestId '{0}' is already running")]
    WorkspaceBusy(String),
    #[error("Unsafe file path detected: {entry}")]
    UnsafeArchiveEntry { entry: String },
    #[error("failed to read archive: {0}")]
    ArchiveCorrupt(String),
    #[error("{manifest} not found in uploaded archive")]
    ManifestNotFound { manifest: String },
    #[error("[{program}] could not be started: {reason}")]
    LaunchFailure { program: String, reason: String },
    #[error("[{program}] Failed with code {code}\n{stderr}")]
    StageFailure {
        program: String,
        code: i32,
        stderr: String,
    },
    #[error("[{program}] timed out after {limit:?}")]
    StageTimeout { program: String, limit: Duration },
    #[error("{what} not found in {}", .dir.display())]
    ArtifactMissing { what: String, dir: PathBuf },
    #[error("failed to remove workspace {}: {source}", .path.display())]
    CleanupFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Message(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Exit code of the failing stage, if this error came from one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            PipelineError::StageFailure { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha256::digest;
    digest(bytes)
}

/// Multi-threaded runtime for the command entry points.
pub fn build_runtime() -> PipelineResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| PipelineError::Message(format!("failed to start runtime: {e}")))
}
