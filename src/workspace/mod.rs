//! Workspace handling: archive extraction and per-job directory lifecycle.

pub mod extract;
pub mod lifecycle;

pub use extract::{ArchiveFormat, ExtractLimits, ExtractReport, extract, extract_with_limits};
pub use lifecycle::{Workspace, cleanup};

use crate::{PipelineError, PipelineResult};

const MAX_REQUEST_ID_LEN: usize = 128;

/// Request ids name workspace directories, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_request_id(id: &str) -> PipelineResult<()> {
    let ok = !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(PipelineError::InvalidRequest(format!(
            "requestId must be 1-{MAX_REQUEST_ID_LEN} characters of [A-Za-z0-9_-]"
        )))
    }
}
