use std::io::Cursor;

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use sha2::{Digest, Sha256};
use vitrine_contracts::errors::ValidationError;

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_DIMENSION: u32 = 1600;
pub const THUMBNAIL_DIMENSION: u32 = 320;

const MAIN_JPEG_QUALITY: u8 = 85;
const THUMBNAIL_JPEG_QUALITY: u8 = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub extension: &'static str,
    pub width: u32,
    pub height: u32,
}

pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes).ok()? {
        ImageFormat::Png => Some("image/png"),
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::WebP => Some("image/webp"),
        ImageFormat::Gif => Some("image/gif"),
        _ => None,
    }
}

/// Checks a user-selected file and returns its MIME type.
pub fn validate_upload(file_name: &str, bytes: &[u8]) -> Result<&'static str, ValidationError> {
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(ValidationError::FileTooLarge {
            file_name: file_name.to_string(),
            size: bytes.len(),
            max: MAX_UPLOAD_BYTES,
        });
    }
    sniff_mime(bytes).ok_or_else(|| ValidationError::UnsupportedFileType {
        file_name: file_name.to_string(),
    })
}

pub fn extension_for_mime(mime: &str) -> &'static str {
    let lowered = mime.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    if lowered.contains("gif") {
        return "gif";
    }
    "png"
}

/// Storage-ready main variant: longest side clamped, re-encoded.
pub fn optimize(bytes: &[u8]) -> Result<EncodedImage> {
    let image = image::load_from_memory(bytes).context("image decode failed")?;
    encode(fit_within(image, MAX_DIMENSION), MAIN_JPEG_QUALITY)
}

pub fn thumbnail(bytes: &[u8]) -> Result<EncodedImage> {
    let image = image::load_from_memory(bytes).context("image decode failed")?;
    encode(
        fit_within(image, THUMBNAIL_DIMENSION),
        THUMBNAIL_JPEG_QUALITY,
    )
}

fn fit_within(image: DynamicImage, max_dim: u32) -> DynamicImage {
    if image.width() <= max_dim && image.height() <= max_dim {
        return image;
    }
    image.resize(max_dim, max_dim, FilterType::Triangle)
}

fn encode(image: DynamicImage, jpeg_quality: u8) -> Result<EncodedImage> {
    let (width, height) = (image.width(), image.height());
    let mut bytes = Vec::new();
    if image.color().has_alpha() {
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .context("png encode failed")?;
        return Ok(EncodedImage {
            bytes,
            mime_type: "image/png",
            extension: "png",
            width,
            height,
        });
    }
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, jpeg_quality);
    encoder
        .encode_image(&DynamicImage::ImageRgb8(image.to_rgb8()))
        .context("jpeg encode failed")?;
    Ok(EncodedImage {
        bytes,
        mime_type: "image/jpeg",
        extension: "jpg",
        width,
        height,
    })
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `products/{product}/{hash8}-{pending}.{ext}`
pub fn object_path(product_id: &str, pending_id: &str, bytes: &[u8], extension: &str) -> String {
    let hash = content_hash(bytes);
    format!(
        "products/{}/{}-{}.{}",
        product_id.trim(),
        &hash[..8],
        pending_id,
        extension
    )
}

pub fn thumbnail_path(main_path: &str) -> String {
    match main_path.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/thumbs/{file}"),
        None => format!("thumbs/{main_path}"),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};

    pub fn png(width: u32, height: u32) -> Vec<u8> {
        let mut image = RgbImage::new(width, height);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            *pixel = Rgb([(x % 256) as u8, (y % 256) as u8, 128]);
        }
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap_or_else(|err| panic!("fixture encode: {err}"));
        bytes
    }

    pub fn transparent_png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 0]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap_or_else(|err| panic!("fixture encode: {err}"));
        bytes
    }
}
