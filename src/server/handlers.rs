//! Job endpoints: multipart upload in, JSON or zip out.

use std::sync::Arc;

use axum::Json;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Multipart, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::engine::{JobKind, JobOptions, Profiler, StageRunner};
use crate::package::ResponsePayload;
use crate::service::{JobRequest, PipelineService};
use crate::{PipelineError, PipelineResult};

use super::error::ApiError;

/// Multipart form field carrying the project archive.
pub const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobQuery {
    pub request_id: Option<String>,
    pub include_starknet_verifier: Option<String>,
    /// Comma separated, e.g. `opcodes,gates`.
    pub profilers: Option<String>,
}

impl JobQuery {
    pub fn options(&self) -> PipelineResult<JobOptions> {
        let cairo_verifier = match self.include_starknet_verifier.as_deref() {
            None => false,
            Some("true") | Some("1") => true,
            Some("false") | Some("0") | Some("") => false,
            Some(other) => {
                return Err(PipelineError::InvalidRequest(format!(
                    "includeStarknetVerifier must be true or false, got '{other}'"
                )));
            }
        };
        let profilers = match &self.profilers {
            None => Vec::new(),
            Some(list) => list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.parse::<Profiler>().map_err(PipelineError::InvalidRequest))
                .collect::<PipelineResult<Vec<_>>>()?,
        };
        Ok(JobOptions {
            profilers,
            cairo_verifier,
        })
    }

    fn request_id(&self) -> String {
        self.request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

pub async fn health() -> &'static str {
    "Noir backend is running"
}

pub async fn compile<R: StageRunner + 'static>(
    State(service): State<Arc<PipelineService<R>>>,
    query: Result<Query<JobQuery>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    submit(JobKind::Compile, service, query, multipart).await
}

pub async fn compile_with_profiling<R: StageRunner + 'static>(
    State(service): State<Arc<PipelineService<R>>>,
    query: Result<Query<JobQuery>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    submit(JobKind::CompileWithProfiling, service, query, multipart).await
}

pub async fn generate_proof<R: StageRunner + 'static>(
    State(service): State<Arc<PipelineService<R>>>,
    query: Result<Query<JobQuery>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    submit(JobKind::Prove, service, query, multipart).await
}

pub async fn generate_proof_with_verifier<R: StageRunner + 'static>(
    State(service): State<Arc<PipelineService<R>>>,
    query: Result<Query<JobQuery>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    submit(JobKind::ProveWithVerifier, service, query, multipart).await
}

async fn submit<R: StageRunner + 'static>(
    kind: JobKind,
    service: Arc<PipelineService<R>>,
    query: Result<Query<JobQuery>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|e| PipelineError::InvalidRequest(e.body_text()))?;
    let options = query.options()?;
    let request_id = query.request_id();
    let limit = service.config().max_upload_bytes;
    let archive = read_upload(multipart, limit).await?;
    debug!(request_id = %request_id, kind = %kind, bytes = archive.len(), "upload received");

    let payload = service
        .run_job(JobRequest {
            kind,
            request_id,
            options,
            archive,
        })
        .await?;
    Ok(into_response(payload))
}

/// Bytes of the `file` field. A missing or unreadable form is `UploadMissing`.
async fn read_upload(
    multipart: Result<Multipart, MultipartRejection>,
    limit: usize,
) -> PipelineResult<Vec<u8>> {
    let mut multipart = multipart.map_err(|e| {
        debug!("not a multipart upload: {e}");
        PipelineError::UploadMissing
    })?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let bytes = field.bytes().await.map_err(|e| multipart_error(e, limit))?;
        if bytes.len() > limit {
            return Err(PipelineError::PayloadTooLarge { limit });
        }
        return Ok(bytes.to_vec());
    }
    Err(PipelineError::UploadMissing)
}

fn multipart_error(e: MultipartError, limit: usize) -> PipelineError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        PipelineError::PayloadTooLarge { limit }
    } else {
        PipelineError::InvalidRequest(e.body_text())
    }
}

fn into_response(payload: ResponsePayload) -> Response {
    match payload {
        ResponsePayload::Inline(inline) => Json(inline).into_response(),
        ResponsePayload::Archive { filename, bytes } => (
            [
                (header::CONTENT_TYPE, "application/zip".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename={filename}"),
                ),
            ],
            bytes,
        )
            .into_response(),
    }
}
