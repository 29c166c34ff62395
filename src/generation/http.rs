use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use tracing::{debug, warn};

use super::{GenerationBackend, classify_failure, parse_success};
use crate::{
    config::ClientConfig,
    errors::GenerationError,
    models::{GenerateResponseBody, GenerationRequest, GenerationResult},
};

/// Client for the `/api/generate` proxy.
pub struct HttpGenerationClient {
    http: HttpClient,
    endpoint: String,
}

impl HttpGenerationClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = HttpClient::builder()
            .user_agent(concat!("thumbnail-maker/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }

    /// `None` when no endpoint is configured.
    pub fn from_config(config: &ClientConfig) -> Result<Option<Self>, reqwest::Error> {
        config
            .endpoint
            .as_deref()
            .map(|endpoint| Self::new(endpoint, config.timeout))
            .transpose()
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        if request.prompt_text.trim().is_empty() {
            return Err(GenerationError::NoPromptProvided);
        }

        debug!(
            target: "generation",
            endpoint = %self.endpoint,
            variant = %request.variant,
            has_image = request.image.is_some(),
            face_lock = request.face_lock,
            "sending generation request"
        );

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request.to_body())
            .send()
            .await
            .map_err(|err| {
                warn!(target: "generation", error = %err, "generation request did not complete");
                GenerationError::UpstreamFailure(format!("generation request failed: {err}"))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|err| {
            GenerationError::UpstreamFailure(format!("failed to read generation response: {err}"))
        })?;

        if !status.is_success() {
            let failure = classify_failure(status, &body);
            warn!(
                target: "generation",
                status = status.as_u16(),
                code = failure.code(),
                "generation endpoint returned an error"
            );
            return Err(failure);
        }

        let parsed: GenerateResponseBody = serde_json::from_str(&body).map_err(|err| {
            GenerationError::UpstreamFailure(format!("invalid generation response: {err}"))
        })?;
        parse_success(parsed)
    }
}
