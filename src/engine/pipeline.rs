//! Job plans and the sequencing loop that executes them.
//!
//! Every job kind is described as data: an ordered list of stages, each required or
//! optional, plus the artifacts to collect afterwards. One loop runs any plan:
//!
//! 1. locate the project root (`Nargo.toml`)
//! 2. run required stages in order, stopping at the first failure
//! 3. run optional stages, logging and absorbing their failures
//! 4. read the declared artifacts out of the workspace
//!
//! Artifacts tied to an optional stage are only collected when that stage succeeded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::logging::LogBroker;
use crate::{PipelineError, PipelineResult};

use super::artifact::{Artifact, ArtifactKind, ArtifactSet};
use super::layout::{
    self, Locator, MANIFEST_FILE, PROVER_CONFIG_FILE, SelectionRule, TARGET_DIR,
};
use super::run_blocking;
use super::runner::StageRunner;
use super::toolchain::{Criticality, Profiler, Stage, Toolchain, WITNESS_PLACEHOLDER};

/// What a job produces; selected by the endpoint it was submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Compile,
    CompileWithProfiling,
    Prove,
    ProveWithVerifier,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Compile => "compile",
            JobKind::CompileWithProfiling => "compile-with-profiling",
            JobKind::Prove => "generate-proof",
            JobKind::ProveWithVerifier => "generate-proof-with-verifier",
        }
    }

    /// Whether the response is a zip archive rather than inline JSON.
    pub fn returns_archive(self) -> bool {
        matches!(self, JobKind::CompileWithProfiling | JobKind::ProveWithVerifier)
    }

    /// Line relayed to the log channel when a job of this kind succeeds.
    pub fn success_message(self) -> &'static str {
        match self {
            JobKind::Compile => "Compilation succeeded!",
            JobKind::CompileWithProfiling => "Compilation and profiling succeeded!",
            JobKind::Prove | JobKind::ProveWithVerifier => "Proof + Verifier generated successfully.",
        }
    }

    /// Prefix of the line relayed when a job of this kind fails.
    pub fn failure_label(self) -> &'static str {
        match self {
            JobKind::Compile => "Compilation",
            JobKind::CompileWithProfiling => "Profiling",
            JobKind::Prove | JobKind::ProveWithVerifier => "generate-proof",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compile" => Ok(JobKind::Compile),
            "compile-with-profiling" => Ok(JobKind::CompileWithProfiling),
            "prove" | "generate-proof" => Ok(JobKind::Prove),
            "prove-with-verifier" | "generate-proof-with-verifier" => {
                Ok(JobKind::ProveWithVerifier)
            }
            other => Err(format!(
                "unknown job kind '{other}' (expected compile, compile-with-profiling, prove or prove-with-verifier)"
            )),
        }
    }
}

/// Coarse progress of a job, logged as stages start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Extracting,
    Compiling,
    Checking,
    Executing,
    Proving,
    GeneratingVerifier,
    Profiling,
    SecondaryVerifier,
    Collecting,
    Done,
    Failed,
}

/// Per-job switches for optional stages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    pub profilers: Vec<Profiler>,
    pub cairo_verifier: bool,
}

/// One artifact to read after the stages ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub kind: ArtifactKind,
    pub locator: Locator,
    pub required: bool,
}

impl ArtifactSpec {
    fn required(kind: ArtifactKind, locator: Locator) -> Self {
        ArtifactSpec {
            kind,
            locator,
            required: true,
        }
    }

    fn optional(kind: ArtifactKind, locator: Locator) -> Self {
        ArtifactSpec {
            kind,
            locator,
            required: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannedStage {
    pub stage: Stage,
    pub criticality: Criticality,
    pub phase: JobPhase,
    /// Collected only if this stage succeeds.
    pub produces: Vec<ArtifactSpec>,
}

impl PlannedStage {
    fn required(stage: Stage, phase: JobPhase) -> Self {
        PlannedStage {
            stage,
            criticality: Criticality::Required,
            phase,
            produces: Vec::new(),
        }
    }

    fn optional(stage: Stage, phase: JobPhase, produces: ArtifactSpec) -> Self {
        PlannedStage {
            stage,
            criticality: Criticality::Optional,
            phase,
            produces: vec![produces],
        }
    }
}

/// Profilers run by `compile-with-profiling` when the request names none.
pub const DEFAULT_PROFILERS: [Profiler; 2] = [Profiler::Opcodes, Profiler::Gates];

/// Ordered stages plus unconditional artifacts for one job.
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub stages: Vec<PlannedStage>,
    pub artifacts: Vec<ArtifactSpec>,
}

impl JobPlan {
    pub fn build(kind: JobKind, options: &JobOptions, toolchain: &Toolchain) -> Self {
        let mut stages = Vec::new();
        let mut artifacts = Vec::new();

        match kind {
            JobKind::Compile | JobKind::CompileWithProfiling => {
                stages.push(PlannedStage::required(toolchain.compile(), JobPhase::Compiling));
                stages.push(PlannedStage::required(toolchain.check(), JobPhase::Checking));
                artifacts.push(ArtifactSpec::required(
                    ArtifactKind::Circuit,
                    Locator::first_with_suffix(TARGET_DIR, ".json"),
                ));
                artifacts.push(ArtifactSpec::required(
                    ArtifactKind::ProverConfig,
                    Locator::Exact(PROVER_CONFIG_FILE.to_string()),
                ));
            }
            JobKind::Prove | JobKind::ProveWithVerifier => {
                stages.push(PlannedStage::required(toolchain.execute(), JobPhase::Executing));
                stages.push(PlannedStage::required(toolchain.prove(), JobPhase::Proving));
                stages.push(PlannedStage::required(toolchain.write_vk(), JobPhase::Proving));
                stages.push(PlannedStage::required(
                    toolchain.write_solidity_verifier(),
                    JobPhase::GeneratingVerifier,
                ));
                artifacts.push(ArtifactSpec::required(
                    ArtifactKind::Proof,
                    Locator::Exact(format!("{TARGET_DIR}/proof")),
                ));
                artifacts.push(ArtifactSpec::required(
                    ArtifactKind::VerificationKey,
                    Locator::Exact(format!("{TARGET_DIR}/vk")),
                ));
                artifacts.push(ArtifactSpec::required(
                    ArtifactKind::SolidityVerifier,
                    Locator::Exact(format!("{TARGET_DIR}/Verifier.sol")),
                ));
            }
        }

        let profilers: Vec<Profiler> = match kind {
            JobKind::CompileWithProfiling if options.profilers.is_empty() => {
                DEFAULT_PROFILERS.to_vec()
            }
            JobKind::CompileWithProfiling | JobKind::ProveWithVerifier => {
                dedup(&options.profilers)
            }
            JobKind::Compile | JobKind::Prove => Vec::new(),
        };
        for profiler in profilers {
            stages.push(PlannedStage::optional(
                toolchain.profile(profiler),
                JobPhase::Profiling,
                ArtifactSpec::optional(
                    ArtifactKind::Profile(profiler),
                    Locator::AllUnder(profiler.output_dir()),
                ),
            ));
        }

        if kind == JobKind::ProveWithVerifier && options.cairo_verifier {
            stages.push(PlannedStage::optional(
                toolchain.cairo_verifier(),
                JobPhase::SecondaryVerifier,
                ArtifactSpec::optional(
                    ArtifactKind::CairoVerifier,
                    Locator::all_with_suffix("verifier/src", ".cairo"),
                ),
            ));
        }

        JobPlan { stages, artifacts }
    }

    pub fn labels(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.stage.label()).collect()
    }
}

fn dedup(profilers: &[Profiler]) -> Vec<Profiler> {
    let mut out: Vec<Profiler> = Vec::with_capacity(profilers.len());
    for p in profilers {
        if !out.contains(p) {
            out.push(*p);
        }
    }
    out
}

/// Runs job plans against extracted workspaces.
pub struct Orchestrator<'a, R> {
    runner: &'a R,
    broker: &'a LogBroker,
    toolchain: &'a Toolchain,
    selection: SelectionRule,
}

impl<'a, R: StageRunner> Orchestrator<'a, R> {
    pub fn new(runner: &'a R, broker: &'a LogBroker, toolchain: &'a Toolchain) -> Self {
        Orchestrator {
            runner,
            broker,
            toolchain,
            selection: SelectionRule::default(),
        }
    }

    pub fn with_selection(mut self, selection: SelectionRule) -> Self {
        self.selection = selection;
        self
    }

    /// Run `kind` in `workspace` and return the collected artifacts.
    ///
    /// Fails with the first required-stage error, `ManifestNotFound` or `ArtifactMissing`.
    pub async fn execute(
        &self,
        kind: JobKind,
        workspace: &Path,
        options: &JobOptions,
        request_id: &str,
    ) -> PipelineResult<ArtifactSet> {
        let plan = JobPlan::build(kind, options, self.toolchain);
        debug!(request_id, kind = %kind, stages = ?plan.labels(), "job planned");

        let ws = workspace.to_path_buf();
        let root = run_blocking(move || layout::find_manifest_root(&ws)).await?;
        self.broker.relay(
            request_id,
            format!("[debug] Found {MANIFEST_FILE} at: {}", root.join(MANIFEST_FILE).display()),
        );

        let completed = self.run_stages(&plan, &root, request_id).await?;

        info!(request_id, phase = ?JobPhase::Collecting, "collecting artifacts");
        let mut specs = plan.artifacts.clone();
        for index in completed {
            specs.extend(plan.stages[index].produces.iter().cloned());
        }
        let selection = self.selection;
        let (artifacts, omitted) = run_blocking(move || collect(&root, &specs, selection)).await?;
        for kind in omitted {
            warn!(request_id, "optional artifact missing: {}", kind.describe());
        }
        Ok(artifacts)
    }

    /// Run every stage of `plan`, returning the indices of the stages that succeeded.
    async fn run_stages(
        &self,
        plan: &JobPlan,
        root: &Path,
        request_id: &str,
    ) -> PipelineResult<Vec<usize>> {
        let total = plan.stages.len();
        let mut completed = Vec::with_capacity(total);

        for (index, planned) in plan.stages.iter().enumerate() {
            let label = planned.stage.label();
            info!(
                request_id,
                phase = ?planned.phase,
                stage = %label,
                "stage {}/{}",
                index + 1,
                total
            );

            match (self.run_stage(&planned.stage, root, request_id).await, planned.criticality) {
                (Ok(()), _) => completed.push(index),
                (Err(e), Criticality::Required) => {
                    warn!(request_id, phase = ?JobPhase::Failed, stage = %label, "required stage failed: {e}");
                    return Err(e);
                }
                (Err(e), Criticality::Optional) => {
                    warn!(request_id, stage = %label, "optional stage failed, continuing: {e}");
                    self.broker
                        .relay(request_id, format!("Warning: {label} failed, continuing: {e}"));
                }
            }
        }
        Ok(completed)
    }

    async fn run_stage(&self, stage: &Stage, root: &Path, request_id: &str) -> PipelineResult<()> {
        let resolved = self.resolve_placeholders(stage, root, request_id).await?;
        self.runner.run(&resolved, root, Some(request_id)).await
    }

    async fn resolve_placeholders(
        &self,
        stage: &Stage,
        root: &Path,
        request_id: &str,
    ) -> PipelineResult<Stage> {
        let mut values = HashMap::new();
        let target = root.join(TARGET_DIR);
        for placeholder in stage.placeholders() {
            let (suffix, what) = if placeholder == WITNESS_PLACEHOLDER {
                (".gz", "Witness file (.gz)".to_string())
            } else {
                (".json", ArtifactKind::Circuit.describe())
            };
            let dir = target.clone();
            let selection = self.selection;
            let found = run_blocking(move || {
                Ok(layout::select(layout::files_with_suffix(&dir, suffix)?, selection))
            })
            .await?
            .ok_or_else(|| PipelineError::ArtifactMissing {
                what,
                dir: target.clone(),
            })?;
            let file_name = found
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let rel = format!("{TARGET_DIR}/{file_name}");
            if placeholder == WITNESS_PLACEHOLDER {
                self.broker
                    .relay(request_id, format!("Using witness file: {rel}"));
            }
            values.insert(placeholder, rel);
        }
        stage.resolve(&values)
    }
}

/// Read every artifact in `specs`. Returns the set and the optional kinds that were absent.
pub fn collect(
    root: &Path,
    specs: &[ArtifactSpec],
    selection: SelectionRule,
) -> PipelineResult<(ArtifactSet, Vec<ArtifactKind>)> {
    let mut set = ArtifactSet::new();
    let mut omitted = Vec::new();

    for spec in specs {
        let found = spec.locator.locate(root, selection)?;
        if found.is_empty() {
            if spec.required {
                return Err(PipelineError::ArtifactMissing {
                    what: spec.kind.describe(),
                    dir: locator_dir(root, &spec.locator),
                });
            }
            omitted.push(spec.kind);
            continue;
        }
        for located in found {
            let bytes = std::fs::read(&located.path)?;
            set.push(Artifact {
                kind: spec.kind,
                name: located.name,
                bytes,
            });
        }
    }
    Ok((set, omitted))
}

fn locator_dir(root: &Path, locator: &Locator) -> PathBuf {
    match locator.dir() {
        "" => root.to_path_buf(),
        dir => root.join(dir),
    }
}
