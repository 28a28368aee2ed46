use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::debug;

use crate::PipelineError;

/// A pipeline error rendered as `{ success: false, error }`.
#[derive(Debug)]
pub struct ApiError(pub PipelineError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            PipelineError::UploadMissing | PipelineError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            PipelineError::WorkspaceBusy(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        debug!(status = status.as_u16(), "request failed: {}", self.0);
        (
            status,
            Json(json!({ "success": false, "error": self.0.to_string() })),
        )
            .into_response()
    }
}
