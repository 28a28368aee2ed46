//! Files copied out of a workspace for the response.

use super::toolchain::Profiler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Circuit,
    ProverConfig,
    Proof,
    VerificationKey,
    SolidityVerifier,
    CairoVerifier,
    Profile(Profiler),
}

impl ArtifactKind {
    /// Human readable name used in error messages.
    pub fn describe(self) -> String {
        match self {
            ArtifactKind::Circuit => "Compiled circuit JSON".to_string(),
            ArtifactKind::ProverConfig => "Prover.toml".to_string(),
            ArtifactKind::Proof => "Proof file".to_string(),
            ArtifactKind::VerificationKey => "Verification key".to_string(),
            ArtifactKind::SolidityVerifier => "Solidity verifier".to_string(),
            ArtifactKind::CairoVerifier => "Cairo verifier files".to_string(),
            ArtifactKind::Profile(p) => format!("{p} profiler output"),
        }
    }

    /// Path inside a response archive for a file located as `name`.
    pub fn archive_path(self, name: &str) -> String {
        match self {
            ArtifactKind::Circuit => format!("circuit/{name}"),
            ArtifactKind::ProverConfig => "Prover.toml".to_string(),
            ArtifactKind::Proof => "proof".to_string(),
            ArtifactKind::VerificationKey => "vk".to_string(),
            ArtifactKind::SolidityVerifier => format!("verifier/solidity/{name}"),
            ArtifactKind::CairoVerifier => format!("verifier/cairo/{name}"),
            ArtifactKind::Profile(p) => format!("profiler/{p}/{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    /// Name relative to the directory it was found in.
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Artifact {
    pub fn archive_path(&self) -> String {
        self.kind.archive_path(&self.name)
    }
}

/// Everything collected for one job, in collection order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactSet {
    artifacts: Vec<Artifact>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, artifact: Artifact) {
        self.artifacts.push(artifact);
    }

    pub fn first(&self, kind: ArtifactKind) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }

    pub fn of_kind(&self, kind: ArtifactKind) -> impl Iterator<Item = &Artifact> {
        self.artifacts.iter().filter(move |a| a.kind == kind)
    }

    pub fn contains(&self, kind: ArtifactKind) -> bool {
        self.first(kind).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.iter()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}
