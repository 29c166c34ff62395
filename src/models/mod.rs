use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use serde::{Deserialize, Serialize};

/// Quality tier of a generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Preview,
    Final,
}

impl Variant {
    /// Synthesis resolution as `(width, height)`.
    pub fn resolution(self) -> (u32, u32) {
        match self {
            Variant::Preview => (896, 512),
            Variant::Final => (1280, 720),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Preview => "preview",
            Variant::Final => "final",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A preprocessed upload: base64 payload plus its mime type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub data: String,
    pub mime_type: String,
}

impl EncodedImage {
    pub fn new(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// How a supplied headshot is to be treated by synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceMode {
    NoFace,
    Reference,
    Locked,
}

impl FaceMode {
    pub fn from_flags(has_image: bool, face_lock: bool) -> Self {
        match (has_image, face_lock) {
            (false, _) => FaceMode::NoFace,
            (true, false) => FaceMode::Reference,
            (true, true) => FaceMode::Locked,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt_text: String,
    pub image: Option<EncodedImage>,
    pub variant: Variant,
    pub face_lock: bool,
}

impl GenerationRequest {
    pub fn new(
        prompt_text: impl Into<String>,
        image: Option<EncodedImage>,
        variant: Variant,
        face_lock: bool,
    ) -> Self {
        Self {
            prompt_text: prompt_text.into(),
            image,
            variant,
            face_lock,
        }
    }

    pub fn face_mode(&self) -> FaceMode {
        FaceMode::from_flags(self.image.is_some(), self.face_lock)
    }

    pub fn to_body(&self) -> GenerateRequestBody {
        GenerateRequestBody {
            prompt_text: self.prompt_text.clone(),
            headshot_base64: self.image.as_ref().map(|image| image.data.clone()),
            mime_type: self.image.as_ref().map(|image| image.mime_type.clone()),
            quality: self.variant,
            face_lock: self.face_lock && self.image.is_some(),
        }
    }
}

/// A synthesized thumbnail as returned by the generation endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    pub data: String,
    pub mime_type: String,
}

impl GenerationResult {
    pub fn from_base64(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: "image/jpeg".to_string(),
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64_STANDARD.decode(self.data.trim())
    }
}

/// Body of `POST /api/generate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequestBody {
    #[serde(default)]
    pub prompt_text: String,
    #[serde(default)]
    pub headshot_base64: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default = "default_quality")]
    pub quality: Variant,
    #[serde(default)]
    pub face_lock: bool,
}

fn default_quality() -> Variant {
    Variant::Preview
}

impl GenerateRequestBody {
    pub fn into_request(self) -> GenerationRequest {
        let image = self.headshot_base64.filter(|data| !data.is_empty()).map(|data| {
            EncodedImage::new(
                data,
                self.mime_type
                    .unwrap_or_else(|| "image/jpeg".to_string()),
            )
        });
        GenerationRequest::new(self.prompt_text, image, self.quality, self.face_lock)
    }
}

/// Response of `POST /api/generate`: `thumbnail` on success, `error` (and
/// optionally `code`) otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponseBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl GenerateResponseBody {
    pub fn thumbnail(data: impl Into<String>) -> Self {
        Self {
            thumbnail: Some(data.into()),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>, code: &str) -> Self {
        Self {
            error: Some(message.into()),
            code: Some(code.to_string()),
            ..Self::default()
        }
    }
}
