use async_trait::async_trait;
use reqwest::{Client as HttpClient, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    config::OpenRouterConfig,
    errors::GenerationError,
    generation::GenerationBackend,
    models::{FaceMode, GenerationRequest, GenerationResult},
};

const PROMPT_ENGINEER_SYSTEM_PROMPT: &str = "You are an expert prompt engineer for AI image generation models. Your task is to take a YouTube video title and transform it into a detailed, descriptive prompt that will generate a high-quality, high-CTR thumbnail. The prompt should be a single paragraph. Do not include any conversational text, headings, or markdown. Only output the final prompt for the image model.";

const FACE_LOCK_INSTRUCTION: &str = "A reference headshot accompanies this request. The prompt must instruct the image model to preserve the person's identity exactly: identical facial structure, skin tone and hairstyle. Only lighting, sharpness and the intensity of the expression may be enhanced, and the background may be replaced. Finish the prompt with: \"Keep the face from the reference photo exactly as it is.\"";

const FACE_REFERENCE_INSTRUCTION: &str = "A reference headshot accompanies this request. Use the person as loose creative inspiration for the main subject; an exact likeness is not required.";

const CHAT_MAX_TOKENS: u32 = 300;
const CHAT_TEMPERATURE: f32 = 0.75;

/// Two-step OpenRouter pipeline: a chat model elaborates the title into a
/// descriptive prompt, then the image model renders it at the variant's
/// resolution.
#[derive(Clone)]
pub struct OpenRouterProvider {
    http: HttpClient,
    api_key: String,
    base_url: String,
    image_model: String,
    chat_model: String,
    referer: String,
    title: String,
}

impl std::fmt::Debug for OpenRouterProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterProvider")
            .field("base_url", &self.base_url)
            .field("image_model", &self.image_model)
            .field("chat_model", &self.chat_model)
            .finish()
    }
}

impl OpenRouterProvider {
    pub fn from_config(config: &OpenRouterConfig) -> Result<Self, reqwest::Error> {
        let http = HttpClient::builder()
            .user_agent(concat!("thumbnail-maker/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            image_model: config.image_model.clone(),
            chat_model: config.chat_model.clone(),
            referer: config.referer.clone(),
            title: config.title.clone(),
        })
    }

    /// Runs both steps. `origin` replaces the configured referer when the
    /// browser supplied one.
    pub async fn generate_with_origin(
        &self,
        request: &GenerationRequest,
        origin: Option<&str>,
    ) -> Result<GenerationResult, GenerationError> {
        let prompt = request.prompt_text.trim();
        if prompt.is_empty() {
            return Err(GenerationError::NoPromptProvided);
        }

        let face = request.face_mode();
        let detailed_prompt = self.elaborate_prompt(prompt, face, origin).await?;
        debug!(
            target: "openrouter",
            variant = %request.variant,
            prompt_len = detailed_prompt.len(),
            "prompt elaborated"
        );
        self.synthesize(&detailed_prompt, request, origin).await
    }

    async fn elaborate_prompt(
        &self,
        prompt: &str,
        face: FaceMode,
        origin: Option<&str>,
    ) -> Result<String, GenerationError> {
        let messages = chat_messages(prompt, face);
        let payload = ChatRequest {
            model: &self.chat_model,
            messages: &messages,
            max_tokens: CHAT_MAX_TOKENS,
            temperature: CHAT_TEMPERATURE,
        };

        let response = self
            .authorized(self.http.post(format!("{}/chat/completions", self.base_url)), origin)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                GenerationError::UpstreamFailure(format!("prompt elaboration request failed: {err}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(target: "openrouter", status = status.as_u16(), body = %body, "chat completion failed");
            return Err(chat_failure(status));
        }

        let chat: ChatResponse = response.json().await.map_err(|err| {
            GenerationError::UpstreamFailure(format!("invalid chat completion response: {err}"))
        })?;

        chat.extract_text().ok_or_else(|| {
            GenerationError::UpstreamFailure(
                "The AI model failed to return a valid prompt.".to_string(),
            )
        })
    }

    async fn synthesize(
        &self,
        detailed_prompt: &str,
        request: &GenerationRequest,
        origin: Option<&str>,
    ) -> Result<GenerationResult, GenerationError> {
        let (width, height) = request.variant.resolution();
        let reference = request.image.as_ref().map(|image| image.data_url());
        let payload = ImageRequest {
            model: &self.image_model,
            prompt: detailed_prompt,
            n: 1,
            width,
            height,
            response_format: "b64_json",
            image: reference.as_deref(),
        };

        let response = self
            .authorized(
                self.http.post(format!("{}/images/generations", self.base_url)),
                origin,
            )
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                GenerationError::UpstreamFailure(format!("image generation request failed: {err}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(target: "openrouter", status = status.as_u16(), body = %body, "image generation failed");
            return Err(image_failure(status, &body, request.face_mode()));
        }

        let images: ImageResponse = response.json().await.map_err(|err| {
            GenerationError::UpstreamFailure(format!("invalid image generation response: {err}"))
        })?;

        images
            .first_image()
            .map(GenerationResult::from_base64)
            .ok_or(GenerationError::EmptyResult)
    }

    fn authorized(&self, builder: RequestBuilder, origin: Option<&str>) -> RequestBuilder {
        builder
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", origin.unwrap_or(self.referer.as_str()))
            .header("X-Title", self.title.as_str())
    }
}

#[async_trait]
impl GenerationBackend for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        self.generate_with_origin(request, None).await
    }
}

fn chat_messages(prompt: &str, face: FaceMode) -> Vec<ChatMessage> {
    let system = match face {
        FaceMode::NoFace => PROMPT_ENGINEER_SYSTEM_PROMPT.to_string(),
        FaceMode::Reference => format!("{PROMPT_ENGINEER_SYSTEM_PROMPT} {FACE_REFERENCE_INSTRUCTION}"),
        FaceMode::Locked => format!("{PROMPT_ENGINEER_SYSTEM_PROMPT} {FACE_LOCK_INSTRUCTION}"),
    };

    vec![
        ChatMessage {
            role: "system",
            content: system,
        },
        ChatMessage {
            role: "user",
            content: format!("Generate an image prompt for a video titled: \"{prompt}\""),
        },
    ]
}

fn chat_failure(status: StatusCode) -> GenerationError {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return GenerationError::ServiceUnavailable(format!(
            "provider rejected credentials ({})",
            status.as_u16()
        ));
    }
    GenerationError::UpstreamFailure(format!(
        "Failed to generate detailed prompt. Status: {}",
        status.as_u16()
    ))
}

fn image_failure(status: StatusCode, body: &str, face: FaceMode) -> GenerationError {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return GenerationError::ServiceUnavailable(format!(
            "provider rejected credentials ({})",
            status.as_u16()
        ));
    }

    let provider_message = serde_json::from_str::<ProviderErrorBody>(body)
        .ok()
        .and_then(|body| body.error)
        .and_then(|error| error.message)
        .filter(|message| !message.trim().is_empty());

    match provider_message {
        Some(message) if face == FaceMode::Locked && mentions_identity(&message) => {
            GenerationError::FaceMatchFailed(format!("Face Match Failed: {message}"))
        }
        Some(message) => {
            GenerationError::UpstreamFailure(format!("Image generation failed: {message}"))
        }
        None => GenerationError::UpstreamFailure(format!(
            "Image generation API request failed with status {}",
            status.as_u16()
        )),
    }
}

/// Whole-word match, so "interface" or "surface" do not count.
fn mentions_identity(message: &str) -> bool {
    message
        .split(|ch: char| !ch.is_alphanumeric())
        .map(str::to_lowercase)
        .any(|word| {
            matches!(
                word.as_str(),
                "face" | "faces" | "facial" | "identity" | "likeness"
            )
        })
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

impl ChatResponse {
    fn extract_text(&self) -> Option<String> {
        self.choices
            .first()
            .and_then(|choice| choice.message.as_ref())
            .and_then(|message| message.content.as_deref())
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    }
}

#[derive(Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatChoiceMessage>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    width: u32,
    height: u32,
    response_format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
}

#[derive(Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

impl ImageResponse {
    fn first_image(self) -> Option<String> {
        self.data
            .into_iter()
            .next()
            .and_then(|datum| datum.b64_json)
            .filter(|data| !data.trim().is_empty())
    }
}

#[derive(Deserialize)]
struct ImageDatum {
    #[serde(default)]
    b64_json: Option<String>,
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    error: Option<ProviderErrorDetail>,
}

#[derive(Deserialize)]
struct ProviderErrorDetail {
    #[serde(default)]
    message: Option<String>,
}
