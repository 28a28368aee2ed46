//! Run one job locally, without the HTTP layer.

use std::path::{Path, PathBuf};

use tracing::info;
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::engine::{JobKind, JobOptions};
use crate::package::ResponsePayload;
use crate::service::{JobRequest, PipelineService};
use crate::{PipelineResult, build_runtime};

/// Execute `kind` on the archive at `archive` and write the payload to `output`.
///
/// Relayed log lines are echoed to stderr. When `output` is an existing directory an
/// archive payload is written there under its own file name.
pub fn run(
    config: ServiceConfig,
    kind: JobKind,
    archive: PathBuf,
    request_id: Option<String>,
    options: JobOptions,
    output: PathBuf,
) -> PipelineResult<()> {
    let bytes = std::fs::read(&archive)?;
    let request_id = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(archive = %archive.display(), kind = %kind, request_id = %request_id, "running job");

    let runtime = build_runtime()?;
    let payload = runtime.block_on(async move {
        let service = PipelineService::from_config(config);
        let broker = service.broker().clone();
        let (channel, mut rx) = broker.open_channel();
        let channel_id = channel.id();
        broker.bind(request_id.clone(), channel);

        let printer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                eprintln!("{line}");
            }
        });

        let result = service
            .run_job(JobRequest {
                kind,
                request_id,
                options,
                archive: bytes,
            })
            .await;

        broker.unbind(channel_id);
        let _ = printer.await;
        result
    })?;

    let path = write_payload(&payload, &output)?;
    info!(path = %path.display(), "payload written");
    Ok(())
}

fn write_payload(payload: &ResponsePayload, output: &Path) -> PipelineResult<PathBuf> {
    let path = match payload {
        ResponsePayload::Archive { filename, .. } if output.is_dir() => output.join(filename),
        _ => output.to_path_buf(),
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(&path, payload.to_bytes()?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::InlinePayload;
    use tempfile::tempdir;

    #[test]
    fn archive_lands_in_directory_under_its_name() {
        let dir = tempdir().unwrap();
        let payload = ResponsePayload::Archive {
            filename: "verifier_a.zip".into(),
            bytes: b"PK".to_vec(),
        };
        let path = write_payload(&payload, dir.path()).unwrap();
        assert_eq!(path, dir.path().join("verifier_a.zip"));
        assert_eq!(std::fs::read(path).unwrap(), b"PK");
    }

    #[test]
    fn inline_payload_is_pretty_json() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out/result.json");
        let payload = ResponsePayload::Inline(InlinePayload {
            success: true,
            request_id: "a".into(),
            compiled_json: Some("{}".into()),
            prover_toml: Some(String::new()),
            proof: None,
            vk: None,
            verifier: None,
        });
        write_payload(&payload, &out).unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
        assert_eq!(value["requestId"], "a");
        assert!(value.get("proof").is_none());
    }
}
