//! One job, end to end: workspace, extraction, pipeline, packaging, cleanup.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::engine::{
    JobKind, JobOptions, JobPhase, Orchestrator, ProcessRunner, StageRunner, Toolchain,
    run_blocking,
};
use crate::logging::LogBroker;
use crate::package::{ResponsePayload, package};
use crate::workspace::{self, ExtractLimits, Workspace, validate_request_id};
use crate::{PipelineError, PipelineResult, sha256_hex};

/// A submitted job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub kind: JobKind,
    pub request_id: String,
    pub options: JobOptions,
    pub archive: Vec<u8>,
}

/// Shared state behind every request: configuration, toolchain, runner and log broker.
pub struct PipelineService<R> {
    config: ServiceConfig,
    toolchain: Toolchain,
    runner: R,
    broker: Arc<LogBroker>,
}

impl PipelineService<ProcessRunner> {
    /// Service spawning real processes, with `PATH` and timeout taken from `config`.
    pub fn from_config(config: ServiceConfig) -> Self {
        let broker = Arc::new(LogBroker::new());
        let runner = ProcessRunner::new(broker.clone())
            .with_search_paths(config.toolchain.search_paths())
            .with_timeout(config.stage_timeout());
        Self::new(config, runner, broker)
    }
}

impl<R: StageRunner> PipelineService<R> {
    pub fn new(config: ServiceConfig, runner: R, broker: Arc<LogBroker>) -> Self {
        let toolchain = Toolchain::from_config(&config.toolchain);
        PipelineService {
            config,
            toolchain,
            runner,
            broker,
        }
    }

    pub fn broker(&self) -> &Arc<LogBroker> {
        &self.broker
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run one job and return its payload.
    ///
    /// The workspace is gone (or retained, per configuration) by the time this returns.
    pub async fn run_job(&self, request: JobRequest) -> PipelineResult<ResponsePayload> {
        let JobRequest {
            kind,
            request_id,
            options,
            archive,
        } = request;

        validate_request_id(&request_id)?;
        if archive.is_empty() {
            return Err(PipelineError::UploadMissing);
        }
        if archive.len() > self.config.max_upload_bytes {
            return Err(PipelineError::PayloadTooLarge {
                limit: self.config.max_upload_bytes,
            });
        }

        let workspace = Workspace::create(&self.config.uploads_dir, &request_id).await?;
        info!(
            request_id = %request_id,
            kind = %kind,
            bytes = archive.len(),
            sha256 = %sha256_hex(&archive),
            "job accepted"
        );

        let result = self
            .process(kind, &request_id, &options, archive, workspace.path().to_path_buf())
            .await;

        match &result {
            Ok(_) => {
                info!(request_id = %request_id, phase = ?JobPhase::Done, "job finished");
                self.broker.relay(&request_id, kind.success_message());
            }
            Err(e) => {
                warn!(request_id = %request_id, phase = ?JobPhase::Failed, "job failed: {e}");
                self.broker
                    .relay(&request_id, format!("{} failed: {e}", kind.failure_label()));
            }
        }

        let retain = self.config.retain_workspaces.retains(result.is_ok());
        if let Some(kept) = workspace.finish(retain).await {
            self.broker
                .relay(&request_id, format!("[debug] Workspace retained at: {}", kept.display()));
        }
        result
    }

    async fn process(
        &self,
        kind: JobKind,
        request_id: &str,
        options: &JobOptions,
        archive: Vec<u8>,
        dir: PathBuf,
    ) -> PipelineResult<ResponsePayload> {
        info!(request_id, phase = ?JobPhase::Extracting, "extracting upload");
        let target = dir.clone();
        let limits = ExtractLimits::with_total(self.config.max_extracted_bytes);
        let report =
            run_blocking(move || workspace::extract_with_limits(&archive, &target, limits)).await?;
        if let Some(root) = &report.stripped_root {
            self.broker
                .relay(request_id, format!("[extract] Removing common root prefix: \"{root}\""));
        }
        for entry in &report.skipped {
            self.broker
                .relay(request_id, format!("[extract] Skipped unsafe entry: {entry}"));
        }

        let artifacts = Orchestrator::new(&self.runner, &self.broker, &self.toolchain)
            .with_selection(self.config.artifact_selection)
            .execute(kind, &dir, options, request_id)
            .await?;

        let request_id = request_id.to_string();
        run_blocking(move || package(kind, &request_id, &artifacts)).await
    }
}
