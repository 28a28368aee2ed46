//! Engine module: turns an extracted Noir project into artifacts.
//!
//! # Architecture
//!
//! - **Toolchain**: builds the `nargo`, `bb`, `noir-profiler` and `garaga` invocations
//!   (`Stage`s). It knows arguments, not processes.
//! - **Runner**: executes one stage (`StageRunner`). `ProcessRunner` spawns children and
//!   relays their output; `ScriptedRunner` fakes tools in-process.
//! - **Layout**: where tools leave their files and how to find them.
//! - **Pipeline**: per-kind `JobPlan`s and the `Orchestrator` that sequences them and
//!   collects an `ArtifactSet`.
//!
//! # Boundaries
//!
//! - Stages share data only through the workspace filesystem.
//! - Nothing here knows about HTTP or archives; packaging happens in `crate::package`.

pub mod artifact;
pub mod layout;
pub mod pipeline;
pub mod runner;
pub mod toolchain;

pub use artifact::{Artifact, ArtifactKind, ArtifactSet};
pub use layout::SelectionRule;
pub use pipeline::{JobKind, JobOptions, JobPhase, JobPlan, Orchestrator};
pub use runner::{ProcessRunner, ScriptedRunner, StageRunner};
pub use toolchain::{Criticality, Profiler, Stage, Toolchain};

use crate::{PipelineError, PipelineResult};

/// Run blocking filesystem work off the async executor.
pub(crate) async fn run_blocking<T, F>(f: F) -> PipelineResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> PipelineResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::Message(format!("blocking task failed: {e}")))?
}
