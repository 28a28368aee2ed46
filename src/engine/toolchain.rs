//! External programs driven by the pipeline and the stages built from them.
//!
//! A `Stage` is a program plus arguments. Arguments may carry placeholders
//! (`{circuit}`, `{witness}`) that are resolved against the workspace right before the
//! stage is launched, since their values depend on files written by earlier stages.

use std::collections::HashMap;
use std::path::Path;

use crate::config::ToolchainConfig;
use crate::{PipelineError, PipelineResult};

/// Placeholder for the compiled circuit, e.g. `target/main.json`.
pub const CIRCUIT_PLACEHOLDER: &str = "{circuit}";
/// Placeholder for the solved witness, e.g. `target/main.gz`.
pub const WITNESS_PLACEHOLDER: &str = "{witness}";

/// Whether a stage failure aborts the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    Required,
    Optional,
}

/// One external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub program: String,
    pub args: Vec<String>,
}

impl Stage {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Stage {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Program file name without its directory, as shown in log lines.
    pub fn display_name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.program)
    }

    /// Short name such as `nargo compile` or `bb write_vk`.
    pub fn label(&self) -> String {
        match self.args.first() {
            Some(sub) => format!("{} {}", self.display_name(), sub),
            None => self.display_name().to_string(),
        }
    }

    /// Shell-quoted command line for `sh -c`.
    pub fn command_line(&self) -> PipelineResult<String> {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        shlex::try_join(words).map_err(|e| {
            PipelineError::LaunchFailure {
                program: self.display_name().to_string(),
                reason: format!("cannot quote arguments: {e}"),
            }
        })
    }

    /// Placeholders referenced by this stage's arguments.
    pub fn placeholders(&self) -> Vec<&'static str> {
        [CIRCUIT_PLACEHOLDER, WITNESS_PLACEHOLDER]
            .into_iter()
            .filter(|p| self.args.iter().any(|a| a.contains(p)))
            .collect()
    }

    /// Substitute placeholders. Every placeholder used must have a value.
    pub fn resolve(&self, values: &HashMap<&'static str, String>) -> PipelineResult<Stage> {
        let mut args = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            let mut resolved = arg.clone();
            for placeholder in [CIRCUIT_PLACEHOLDER, WITNESS_PLACEHOLDER] {
                if resolved.contains(placeholder) {
                    let value = values.get(placeholder).ok_or_else(|| {
                        PipelineError::Message(format!(
                            "no value for {placeholder} in {}",
                            self.label()
                        ))
                    })?;
                    resolved = resolved.replace(placeholder, value);
                }
            }
            args.push(resolved);
        }
        Ok(Stage {
            program: self.program.clone(),
            args,
        })
    }
}

/// Profiling passes offered by `noir-profiler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Profiler {
    Opcodes,
    Gates,
    ExecutionOpcodes,
}

impl Profiler {
    pub const ALL: [Profiler; 3] = [Profiler::Opcodes, Profiler::Gates, Profiler::ExecutionOpcodes];

    pub fn as_str(self) -> &'static str {
        match self {
            Profiler::Opcodes => "opcodes",
            Profiler::Gates => "gates",
            Profiler::ExecutionOpcodes => "execution-opcodes",
        }
    }

    /// Directory, relative to the project root, the pass writes into.
    pub fn output_dir(self) -> String {
        format!("target/profiler/{}", self.as_str())
    }
}

impl std::fmt::Display for Profiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Profiler {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "opcodes" => Ok(Profiler::Opcodes),
            "gates" => Ok(Profiler::Gates),
            "execution-opcodes" | "execution_opcodes" => Ok(Profiler::ExecutionOpcodes),
            other => Err(format!(
                "unknown profiler '{other}' (expected opcodes, gates or execution-opcodes)"
            )),
        }
    }
}

/// Builds the stages for nargo, bb, noir-profiler and garaga.
#[derive(Debug, Clone)]
pub struct Toolchain {
    nargo: String,
    bb: String,
    garaga: String,
    noir_profiler: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self::from_config(&ToolchainConfig::default())
    }
}

impl Toolchain {
    pub fn from_config(config: &ToolchainConfig) -> Self {
        Toolchain {
            nargo: config.nargo.clone(),
            bb: config.bb.clone(),
            garaga: config.garaga.clone(),
            noir_profiler: config.noir_profiler.clone(),
        }
    }

    pub fn compile(&self) -> Stage {
        Stage::new(&self.nargo, ["compile"])
    }

    /// `nargo check` also writes a template `Prover.toml` when the project has none.
    pub fn check(&self) -> Stage {
        Stage::new(&self.nargo, ["check"])
    }

    pub fn execute(&self) -> Stage {
        Stage::new(&self.nargo, ["execute"])
    }

    pub fn prove(&self) -> Stage {
        Stage::new(
            &self.bb,
            ["prove", "-b", CIRCUIT_PLACEHOLDER, "-w", WITNESS_PLACEHOLDER, "-o", "target"],
        )
    }

    pub fn write_vk(&self) -> Stage {
        Stage::new(
            &self.bb,
            ["write_vk", "-b", CIRCUIT_PLACEHOLDER, "-o", "target", "--oracle_hash", "keccak"],
        )
    }

    pub fn write_solidity_verifier(&self) -> Stage {
        Stage::new(
            &self.bb,
            ["write_solidity_verifier", "-k", "target/vk", "-o", "target/Verifier.sol"],
        )
    }

    /// Starknet verifier project written to `verifier/`.
    pub fn cairo_verifier(&self) -> Stage {
        Stage::new(
            &self.garaga,
            [
                "gen",
                "--system",
                "ultra_keccak_honk",
                "--vk",
                "target/vk",
                "--project-name",
                "verifier",
            ],
        )
    }

    pub fn profile(&self, profiler: Profiler) -> Stage {
        let output = profiler.output_dir();
        match profiler {
            Profiler::Opcodes => Stage::new(
                &self.noir_profiler,
                ["opcodes", "--artifact-path", CIRCUIT_PLACEHOLDER, "--output", output.as_str()],
            ),
            Profiler::Gates => Stage::new(
                &self.noir_profiler,
                [
                    "gates",
                    "--artifact-path",
                    CIRCUIT_PLACEHOLDER,
                    "--backend-path",
                    self.bb.as_str(),
                    "--output",
                    output.as_str(),
                ],
            ),
            Profiler::ExecutionOpcodes => Stage::new(
                &self.noir_profiler,
                [
                    "execution-opcodes",
                    "--artifact-path",
                    CIRCUIT_PLACEHOLDER,
                    "--prover-toml-path",
                    "Prover.toml",
                    "--output",
                    output.as_str(),
                ],
            ),
        }
    }
}
