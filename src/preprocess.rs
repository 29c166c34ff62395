use std::{io::Cursor, path::Path};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use image::{DynamicImage, codecs::jpeg::JpegEncoder, imageops::FilterType};
use tracing::debug;

use crate::{config::PreprocessConfig, errors::PreprocessError, models::EncodedImage};

pub const OUTPUT_MIME_TYPE: &str = "image/jpeg";

/// Downscales and recompresses an uploaded headshot before it leaves the
/// machine.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    config: PreprocessConfig,
}

impl ImagePreprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// The size limit is checked against file metadata before the file is
    /// read, so oversized uploads are never decoded.
    pub async fn preprocess_file(&self, path: &Path) -> Result<EncodedImage, PreprocessError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(PreprocessError::ReadFailed)?;
        self.check_size(metadata.len())?;

        let bytes = tokio::fs::read(path)
            .await
            .map_err(PreprocessError::ReadFailed)?;
        debug!(target: "preprocess", path = %path.display(), bytes = bytes.len(), "headshot read");

        let config = self.config.clone();
        tokio::task::spawn_blocking(move || encode_bytes(&config, &bytes))
            .await
            .map_err(|err| PreprocessError::EncodeFailed(format!("encoder task failed: {err}")))?
    }

    #[cfg(test)]
    pub fn preprocess_bytes(&self, bytes: &[u8]) -> Result<EncodedImage, PreprocessError> {
        encode_bytes(&self.config, bytes)
    }

    fn check_size(&self, size: u64) -> Result<(), PreprocessError> {
        check_size(&self.config, size)
    }
}

fn check_size(config: &PreprocessConfig, size: u64) -> Result<(), PreprocessError> {
    if size > config.max_file_bytes {
        return Err(PreprocessError::FileTooLarge {
            size,
            limit: config.max_file_bytes,
        });
    }
    Ok(())
}

fn encode_bytes(config: &PreprocessConfig, bytes: &[u8]) -> Result<EncodedImage, PreprocessError> {
    check_size(config, bytes.len() as u64)?;

    let decoded = image::load_from_memory(bytes)
        .map_err(|err| PreprocessError::DecodeFailed(err.to_string()))?;

    let (width, height) = fit_within(
        decoded.width(),
        decoded.height(),
        config.max_width,
        config.max_height,
    );
    let resized = if (width, height) == (decoded.width(), decoded.height()) {
        decoded
    } else {
        decoded.resize_exact(width, height, FilterType::Triangle)
    };

    let jpeg = encode_jpeg(&resized, config.quality)?;
    debug!(
        target: "preprocess",
        width,
        height,
        encoded_bytes = jpeg.len(),
        "headshot compressed"
    );

    Ok(EncodedImage::new(
        BASE64_STANDARD.encode(jpeg),
        OUTPUT_MIME_TYPE,
    ))
}

/// Largest size with the same aspect ratio that fits `max_width` ×
/// `max_height`. Never upscales.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 || (width <= max_width && height <= max_height) {
        return (width, height);
    }

    let scale = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );
    let scaled_width = ((width as f64 * scale).round() as u32).clamp(1, max_width);
    let scaled_height = ((height as f64 * scale).round() as u32).clamp(1, max_height);
    (scaled_width, scaled_height)
}

/// JPEG has no alpha channel, so the image is flattened to RGB first.
pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, PreprocessError> {
    let rgb = image.to_rgb8();
    let mut buffer = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|err| PreprocessError::EncodeFailed(err.to_string()))?;

    let bytes = buffer.into_inner();
    if bytes.is_empty() {
        return Err(PreprocessError::EncodeFailed(
            "encoder produced no output".to_string(),
        ));
    }
    Ok(bytes)
}
