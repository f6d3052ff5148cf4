use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::platform::PlatformTag;

/// Subprocess diagnostics are cut to this many characters before they can
/// reach a client-visible payload.
pub const DIAGNOSTIC_EXCERPT_LIMIT: usize = 500;

/// Failure taxonomy for the extraction invoker.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("Failed to get info: {detail}")]
    MetadataUnavailable { detail: String },
    #[error("Download failed: {detail}")]
    ExtractionFailed { detail: String },
    #[error("The extractor finished but produced no file")]
    NoArtifactProduced,
    #[error("The produced file is too small to be a valid download ({size} bytes)")]
    ArtifactTooSmall { size: u64 },
    #[error("No working way to run the extraction tool was found")]
    ExtractorNotFound,
    #[error("The operation exceeded its time limit")]
    TimedOut,
    #[error("Could not run the extraction tool: {0}")]
    Io(#[from] std::io::Error),
}

impl InvokeError {
    pub fn metadata_unavailable(stderr: &[u8]) -> Self {
        Self::MetadataUnavailable {
            detail: diagnostic_excerpt(stderr),
        }
    }

    pub fn extraction_failed(stderr: &[u8]) -> Self {
        Self::ExtractionFailed {
            detail: diagnostic_excerpt(stderr),
        }
    }

    /// Diagnostic text for advisory failure classification.
    pub fn detail(&self) -> &str {
        match self {
            Self::MetadataUnavailable { detail } | Self::ExtractionFailed { detail } => detail,
            _ => "",
        }
    }
}

pub fn diagnostic_excerpt(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .trim()
        .chars()
        .take(DIAGNOSTIC_EXCERPT_LIMIT)
        .collect()
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    ok: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    platform: Option<PlatformTag>,
}

/// HTTP-level error carried out of every handler.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub hint: Option<String>,
    pub platform: Option<PlatformTag>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            hint: None,
            platform: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn too_many_requests() -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "Too many requests")
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_platform(mut self, platform: PlatformTag) -> Self {
        self.platform = Some(platform);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            ok: false,
            error: self.message,
            hint: self.hint,
            platform: self.platform,
        });

        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_is_truncated_to_limit() {
        let long = "e".repeat(2 * DIAGNOSTIC_EXCERPT_LIMIT);
        let excerpt = diagnostic_excerpt(long.as_bytes());
        assert_eq!(excerpt.chars().count(), DIAGNOSTIC_EXCERPT_LIMIT);
    }

    #[test]
    fn excerpt_trims_and_survives_invalid_utf8() {
        assert_eq!(diagnostic_excerpt(b"  boom \n"), "boom");
        let excerpt = diagnostic_excerpt(&[0xff, 0xfe, b'x']);
        assert!(excerpt.ends_with('x'));
    }

    #[test]
    fn extraction_failed_carries_excerpt() {
        let error = InvokeError::extraction_failed(b"ERROR: video unavailable");
        assert_eq!(error.detail(), "ERROR: video unavailable");
        assert!(error.to_string().contains("video unavailable"));
    }
}
