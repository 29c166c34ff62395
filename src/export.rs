use image::imageops::FilterType;

use crate::{errors::ExportError, models::GenerationResult, preprocess::encode_jpeg};

pub const DOWNLOAD_WIDTH: u32 = 1280;
pub const DOWNLOAD_HEIGHT: u32 = 720;
pub const DOWNLOAD_QUALITY: u8 = 90;

#[derive(Debug, Clone)]
pub struct ExportedThumbnail {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Lowercases, collapses every run of non `[a-z0-9]` characters into one `-`
/// and trims dashes from both ends.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;

    for ch in title.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }

    slug
}

pub fn download_file_name(prompt: &str) -> String {
    let slug = slugify(prompt);
    let slug = if slug.is_empty() { "untitled" } else { slug.as_str() };
    format!("thumbnail-{slug}.jpg")
}

/// Stretches the result onto the 1280×720 download canvas and re-encodes it.
pub fn render_download(
    result: &GenerationResult,
    prompt: &str,
) -> Result<ExportedThumbnail, ExportError> {
    let bytes = result
        .decode()
        .map_err(|err| ExportError::LoadFailed(err.to_string()))?;
    let image =
        image::load_from_memory(&bytes).map_err(|err| ExportError::LoadFailed(err.to_string()))?;

    let canvas = image.resize_exact(DOWNLOAD_WIDTH, DOWNLOAD_HEIGHT, FilterType::Triangle);
    let jpeg = encode_jpeg(&canvas, DOWNLOAD_QUALITY)
        .map_err(|err| ExportError::EncodeFailed(err.to_string()))?;

    Ok(ExportedThumbnail {
        file_name: download_file_name(prompt),
        bytes: jpeg,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
    use image::{DynamicImage, ImageFormat, RgbImage};

    use super::*;

    #[test]
    fn slug_examples() {
        assert_eq!(slugify("My AMAZING Video!!"), "my-amazing-video");
        assert_eq!(download_file_name("My AMAZING Video!!"), "thumbnail-my-amazing-video.jpg");
        assert_eq!(download_file_name("???"), "thumbnail-untitled.jpg");
        assert_eq!(download_file_name(""), "thumbnail-untitled.jpg");
    }

    #[test]
    fn slug_collapses_runs_and_trims_edges() {
        assert_eq!(slugify("  --Top 10   Tips--  "), "top-10-tips");
        assert_eq!(slugify("Café au lait"), "caf-au-lait");
        assert_eq!(slugify("v2.0_release"), "v2-0-release");
    }

    #[test]
    fn download_is_full_hd_canvas() {
        let source = RgbImage::from_pixel(896, 512, image::Rgb([10, 200, 30]));
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(source)
            .write_to(&mut buffer, ImageFormat::Jpeg)
            .expect("jpeg");
        let result = GenerationResult::from_base64(BASE64_STANDARD.encode(buffer.into_inner()));

        let exported = render_download(&result, "Preview Shot").expect("export");
        assert_eq!(exported.file_name, "thumbnail-preview-shot.jpg");

        let image = image::load_from_memory(&exported.bytes).expect("decode");
        assert_eq!((image.width(), image.height()), (DOWNLOAD_WIDTH, DOWNLOAD_HEIGHT));
    }

    #[test]
    fn undecodable_result_fails_to_load() {
        let result = GenerationResult::from_base64(BASE64_STANDARD.encode(b"garbage"));
        assert!(matches!(
            render_download(&result, "x"),
            Err(ExportError::LoadFailed(_))
        ));

        let result = GenerationResult::from_base64("***not base64***");
        assert!(matches!(
            render_download(&result, "x"),
            Err(ExportError::LoadFailed(_))
        ));
    }
}
