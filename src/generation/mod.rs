mod http;

pub use http::HttpGenerationClient;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::{
    errors::GenerationError,
    models::{GenerateResponseBody, GenerationRequest, GenerationResult},
};

/// Anything that can turn a [`GenerationRequest`] into a thumbnail.
///
/// Implementations classify their failures into [`GenerationError`] and never
/// retry; retry policy belongs to the orchestrator.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, GenerationError>;
}

/// Stand-in used when neither a proxy endpoint nor provider credentials are
/// configured.
pub struct UnconfiguredBackend;

#[async_trait]
impl GenerationBackend for UnconfiguredBackend {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn generate(
        &self,
        _request: &GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        Err(GenerationError::ServiceUnavailable(
            "no generation endpoint or OPENROUTER_API_KEY configured".to_string(),
        ))
    }
}

/// Maps a non-2xx proxy response onto the failure taxonomy.
///
/// The explicit `code` wins. Without one, only auth statuses and known
/// message markers escape `UpstreamFailure`; a bare status stays transient
/// because legacy proxies mirror the provider's status.
pub fn classify_failure(status: StatusCode, body: &str) -> GenerationError {
    let parsed = serde_json::from_str::<GenerateResponseBody>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|body| body.error.clone())
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| format!("Generation request failed with status {}", status.as_u16()));

    if let Some(code) = parsed.as_ref().and_then(|body| body.code.as_deref()) {
        match code {
            "service_unavailable" => return GenerationError::ServiceUnavailable(message),
            "no_prompt" => return GenerationError::NoPromptProvided,
            "face_match_failed" => return GenerationError::FaceMatchFailed(message),
            "empty_result" => return GenerationError::EmptyResult,
            "upstream_failure" => return GenerationError::UpstreamFailure(message),
            _ => {}
        }
    }

    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        || message.contains("OPENROUTER_API_KEY")
        || message.contains("not configured")
    {
        GenerationError::ServiceUnavailable(message)
    } else if message.contains("Prompt text is required") {
        GenerationError::NoPromptProvided
    } else if message.contains("Face Match Failed") {
        GenerationError::FaceMatchFailed(message)
    } else {
        GenerationError::UpstreamFailure(message)
    }
}

/// Extracts the thumbnail from a 2xx proxy body; no payload is `EmptyResult`.
pub fn parse_success(body: GenerateResponseBody) -> Result<GenerationResult, GenerationError> {
    body.thumbnail
        .map(|data| data.trim().to_string())
        .filter(|data| !data.is_empty())
        .map(GenerationResult::from_base64)
        .ok_or(GenerationError::EmptyResult)
}
