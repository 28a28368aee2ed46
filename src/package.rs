//! Response payloads built from a job's artifacts.

use std::io::{Cursor, Write};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::engine::{ArtifactKind, ArtifactSet, JobKind};
use crate::{PipelineError, PipelineResult};

/// JSON body returned for `compile` and `prove` jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InlinePayload {
    pub success: bool,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compiled_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prover_toml: Option<String>,
    /// Base64 of the binary proof.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
    /// Base64 of the binary verification key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vk: Option<String>,
    /// Solidity verifier source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    Inline(InlinePayload),
    Archive { filename: String, bytes: Vec<u8> },
}

impl ResponsePayload {
    /// Bytes to write when the payload is saved to a file.
    pub fn to_bytes(&self) -> PipelineResult<Vec<u8>> {
        match self {
            ResponsePayload::Inline(inline) => serde_json::to_vec_pretty(inline)
                .map_err(|e| PipelineError::Message(format!("failed to encode payload: {e}"))),
            ResponsePayload::Archive { bytes, .. } => Ok(bytes.clone()),
        }
    }
}

pub fn archive_filename(kind: JobKind, request_id: &str) -> String {
    match kind {
        JobKind::CompileWithProfiling => format!("profile_{request_id}.zip"),
        _ => format!("verifier_{request_id}.zip"),
    }
}

/// Assemble the response for a successful job.
pub fn package(kind: JobKind, request_id: &str, artifacts: &ArtifactSet) -> PipelineResult<ResponsePayload> {
    if kind.returns_archive() {
        return Ok(ResponsePayload::Archive {
            filename: archive_filename(kind, request_id),
            bytes: build_archive(artifacts)?,
        });
    }

    let text = |k: ArtifactKind| {
        artifacts
            .first(k)
            .map(|a| String::from_utf8_lossy(&a.bytes).into_owned())
    };
    let b64 = |k: ArtifactKind| artifacts.first(k).map(|a| STANDARD.encode(&a.bytes));

    let mut inline = InlinePayload {
        success: true,
        request_id: request_id.to_string(),
        compiled_json: None,
        prover_toml: None,
        proof: None,
        vk: None,
        verifier: None,
    };
    match kind {
        JobKind::Compile => {
            inline.compiled_json = text(ArtifactKind::Circuit);
            inline.prover_toml = text(ArtifactKind::ProverConfig);
        }
        _ => {
            inline.proof = b64(ArtifactKind::Proof);
            inline.vk = b64(ArtifactKind::VerificationKey);
            inline.verifier = text(ArtifactKind::SolidityVerifier);
        }
    }
    Ok(ResponsePayload::Inline(inline))
}

/// Zip every artifact under its fixed archive path.
pub fn build_archive(artifacts: &ArtifactSet) -> PipelineResult<Vec<u8>> {
    let zip_err = |e: zip::result::ZipError| PipelineError::Message(format!("failed to build archive: {e}"));

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for artifact in artifacts.iter() {
        writer.start_file(artifact.archive_path(), options).map_err(zip_err)?;
        writer.write_all(&artifact.bytes)?;
    }
    let cursor = writer.finish().map_err(zip_err)?;
    Ok(cursor.into_inner())
}
