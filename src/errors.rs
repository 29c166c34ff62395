use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

pub const SERVICE_UNAVAILABLE_MESSAGE: &str =
    "Service is not configured. Please contact the administrator.";
pub const FACE_MATCH_FAILED_MESSAGE: &str = "Face Match Failed: the face in your headshot could not be preserved. Please try a different, clearer photo.";
pub const TEMPORARILY_UNAVAILABLE_MESSAGE: &str =
    "Generation is temporarily unavailable. Please try again later.";
pub const NO_PROMPT_MESSAGE: &str = "Please enter a prompt to generate thumbnail.";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    DirectLink(#[from] DirectLinkError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("internal error: {0}")]
    Other(String),
}

impl AppError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Other(format!("{value:#}"))
    }
}

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("image is {size} bytes, limit is {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("failed to read image file: {0}")]
    ReadFailed(#[source] std::io::Error),

    #[error("failed to decode image: {0}")]
    DecodeFailed(String),

    #[error("failed to encode image: {0}")]
    EncodeFailed(String),
}

impl PreprocessError {
    pub fn user_message(&self) -> String {
        match self {
            Self::FileTooLarge { limit, .. } => {
                format!("Image size must be under {}MB.", limit / (1024 * 1024))
            }
            Self::ReadFailed(_) | Self::DecodeFailed(_) => "Failed to process image.".to_string(),
            Self::EncodeFailed(_) => "Failed to compress image.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generation service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("no prompt provided")]
    NoPromptProvided,

    #[error("face match failed: {0}")]
    FaceMatchFailed(String),

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("generation returned no image")]
    EmptyResult,
}

impl GenerationError {
    /// Transient failures the orchestrator may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamFailure(_) | Self::EmptyResult)
    }

    /// Machine-readable code carried in proxy error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::NoPromptProvided => "no_prompt",
            Self::FaceMatchFailed(_) => "face_match_failed",
            Self::UpstreamFailure(_) => "upstream_failure",
            Self::EmptyResult => "empty_result",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::ServiceUnavailable(_) => SERVICE_UNAVAILABLE_MESSAGE.to_string(),
            Self::NoPromptProvided => NO_PROMPT_MESSAGE.to_string(),
            Self::FaceMatchFailed(_) => FACE_MATCH_FAILED_MESSAGE.to_string(),
            Self::UpstreamFailure(message) => message.clone(),
            Self::EmptyResult => "AI did not return an image.".to_string(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectLinkError {
    #[error("no 11-character video id found in link")]
    InvalidLink,

    #[error("no thumbnail candidate exists for video {0}")]
    ThumbnailUnavailable(String),

    #[error("failed to download {url}: {reason}")]
    DownloadFailed { url: String, reason: String },
}

impl DirectLinkError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidLink => "Unable to fetch thumbnail. Please enter a valid video link.",
            Self::ThumbnailUnavailable(_) => {
                "Unable to fetch thumbnail. Please check the video link."
            }
            Self::DownloadFailed { .. } => "Failed to download the image file.",
        }
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("nothing to download")]
    NothingToExport,

    #[error("could not load image for downloading: {0}")]
    LoadFailed(String),

    #[error("failed to create image for download: {0}")]
    EncodeFailed(String),

    #[error("failed to write download: {0}")]
    WriteFailed(#[from] std::io::Error),
}

impl ExportError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NothingToExport => "Please generate a thumbnail first before downloading.",
            Self::LoadFailed(_) => "Could not load image for downloading.",
            Self::EncodeFailed(_) => "Failed to create image for download.",
            Self::WriteFailed(_) => "Failed to save the downloaded image.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_generation_failures_are_retryable() {
        assert!(GenerationError::UpstreamFailure("busy".into()).is_retryable());
        assert!(GenerationError::EmptyResult.is_retryable());
        assert!(!GenerationError::ServiceUnavailable("no key".into()).is_retryable());
        assert!(!GenerationError::FaceMatchFailed("mismatch".into()).is_retryable());
        assert!(!GenerationError::NoPromptProvided.is_retryable());
    }

    #[test]
    fn service_unavailable_never_leaks_technical_detail() {
        let err = GenerationError::ServiceUnavailable("OPENROUTER_API_KEY missing".into());
        assert_eq!(err.user_message(), SERVICE_UNAVAILABLE_MESSAGE);
        assert!(!err.user_message().contains("OPENROUTER_API_KEY"));
    }

    #[test]
    fn file_too_large_reports_limit_in_megabytes() {
        let err = PreprocessError::FileTooLarge {
            size: 20 * 1024 * 1024,
            limit: 10 * 1024 * 1024,
        };
        assert_eq!(err.user_message(), "Image size must be under 10MB.");
    }
}
