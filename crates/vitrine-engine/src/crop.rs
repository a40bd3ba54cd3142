use std::io::Cursor;

use anyhow::Context;
use image::{DynamicImage, GenericImageView, ImageFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::ImageFetcher;
use crate::media::sniff_mime;

/// Output encoding of every crop.
pub const CROP_MIME_TYPE: &str = "image/png";

const PERCENT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CropError {
    #[error("crop rectangle must have a positive width and height")]
    EmptyRect,

    #[error("crop rectangle {x},{y} {width}x{height} lies outside the image")]
    OutOfBounds {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    },

    #[error("crop failed: {0}")]
    CropFailed(String),
}

impl CropError {
    pub fn user_message(&self) -> String {
        match self {
            Self::CropFailed(_) => {
                "The image could not be cropped. Try re-adding it from your computer.".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Crop selection in percent of the natural image size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full() -> Self {
        Self::new(0.0, 0.0, 100.0, 100.0)
    }

    pub fn to_pixels(&self, natural_width: u32, natural_height: u32) -> Result<PixelRect, CropError> {
        let values = [self.x, self.y, self.width, self.height];
        if values.iter().any(|value| !value.is_finite()) || self.width <= 0.0 || self.height <= 0.0
        {
            return Err(CropError::EmptyRect);
        }
        if self.x < 0.0
            || self.y < 0.0
            || self.x + self.width > 100.0 + PERCENT_EPSILON
            || self.y + self.height > 100.0 + PERCENT_EPSILON
        {
            return Err(self.out_of_bounds());
        }

        let scale = |percent: f64, natural: u32| -> u32 {
            ((percent / 100.0) * natural as f64).round().max(0.0) as u32
        };
        let x = scale(self.x, natural_width).min(natural_width);
        let y = scale(self.y, natural_height).min(natural_height);
        let width = scale(self.width, natural_width).min(natural_width - x);
        let height = scale(self.height, natural_height).min(natural_height - y);
        if width == 0 || height == 0 {
            return Err(CropError::EmptyRect);
        }
        Ok(PixelRect {
            x,
            y,
            width,
            height,
        })
    }

    fn out_of_bounds(&self) -> CropError {
        CropError::OutOfBounds {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
        }
    }
}

/// Decoded image bytes owned by this process. Remote images must be fetched
/// into one of these before they can be cropped.
#[derive(Debug, Clone)]
pub struct LocalImage {
    bytes: Vec<u8>,
    mime_type: String,
    image: DynamicImage,
}

impl LocalImage {
    pub fn decode(bytes: Vec<u8>) -> Result<Self, CropError> {
        let mime_type = sniff_mime(&bytes)
            .ok_or_else(|| CropError::CropFailed("unrecognized image data".to_string()))?
            .to_string();
        let image = image::load_from_memory(&bytes)
            .map_err(|err| CropError::CropFailed(format!("decode failed: {err}")))?;
        Ok(Self {
            bytes,
            mime_type,
            image,
        })
    }

    pub fn fetch(fetcher: &dyn ImageFetcher, url: &str) -> anyhow::Result<Self> {
        let bytes = fetcher
            .fetch(url)
            .with_context(|| format!("failed fetching {url}"))?;
        Ok(Self::decode(bytes)?)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CropOutput {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
    pub source: PixelRect,
}

pub fn crop_image(source: &LocalImage, rect: &CropRect) -> Result<CropOutput, CropError> {
    let pixels = rect.to_pixels(source.width(), source.height())?;
    crop_pixels(source, pixels)
}

pub fn crop_pixels(source: &LocalImage, rect: PixelRect) -> Result<CropOutput, CropError> {
    let (width, height) = source.image.dimensions();
    if rect.width == 0 || rect.height == 0 {
        return Err(CropError::EmptyRect);
    }
    if rect.x.saturating_add(rect.width) > width || rect.y.saturating_add(rect.height) > height {
        return Err(CropError::OutOfBounds {
            x: rect.x as f64,
            y: rect.y as f64,
            width: rect.width as f64,
            height: rect.height as f64,
        });
    }

    let cropped = source
        .image
        .crop_imm(rect.x, rect.y, rect.width, rect.height);
    let mut bytes = Vec::new();
    cropped
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|err| CropError::CropFailed(format!("encode failed: {err}")))?;
    if bytes.is_empty() {
        return Err(CropError::CropFailed("encoder produced no data".to_string()));
    }
    Ok(CropOutput {
        bytes,
        mime_type: CROP_MIME_TYPE,
        width: cropped.width(),
        height: cropped.height(),
        source: rect,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::fixtures::png;

    fn source(width: u32, height: u32) -> LocalImage {
        LocalImage::decode(png(width, height)).unwrap_or_else(|err| panic!("{err}"))
    }

    #[test]
    fn output_dimensions_match_rectangle() -> anyhow::Result<()> {
        let image = source(800, 600);
        let rects = [
            CropRect::new(0.0, 0.0, 50.0, 50.0),
            CropRect::new(12.5, 10.0, 37.5, 80.0),
            CropRect::new(25.0, 25.0, 75.0, 75.0),
            CropRect::full(),
        ];
        for rect in rects {
            let expected = rect.to_pixels(800, 600)?;
            let output = crop_image(&image, &rect)?;
            assert_eq!((output.width, output.height), (expected.width, expected.height));
            assert!((output.width as f64 - rect.width * 8.0).abs() <= 1.0);
            assert!((output.height as f64 - rect.height * 6.0).abs() <= 1.0);
            assert_eq!(output.mime_type, "image/png");
            let decoded = image::load_from_memory(&output.bytes)?;
            assert_eq!(decoded.width(), output.width);
        }
        Ok(())
    }

    #[test]
    fn percent_conversion_rounds_and_clamps() -> anyhow::Result<()> {
        let pixels = CropRect::new(33.3, 0.0, 66.7, 100.0).to_pixels(301, 200)?;
        assert_eq!(pixels.x, 100);
        assert_eq!(pixels.x + pixels.width, 301);
        assert_eq!(pixels.height, 200);
        Ok(())
    }

    #[test]
    fn empty_and_out_of_bounds_rects_are_rejected() {
        assert_eq!(
            CropRect::new(0.0, 0.0, 0.0, 10.0).to_pixels(100, 100),
            Err(CropError::EmptyRect)
        );
        assert_eq!(
            CropRect::new(f64::NAN, 0.0, 10.0, 10.0).to_pixels(100, 100),
            Err(CropError::EmptyRect)
        );
        assert!(matches!(
            CropRect::new(60.0, 0.0, 50.0, 10.0).to_pixels(100, 100),
            Err(CropError::OutOfBounds { .. })
        ));
        assert!(matches!(
            CropRect::new(-1.0, 0.0, 50.0, 10.0).to_pixels(100, 100),
            Err(CropError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn pixel_crop_outside_image_is_rejected() {
        let image = source(50, 50);
        let rect = PixelRect {
            x: 40,
            y: 0,
            width: 20,
            height: 10,
        };
        assert!(matches!(
            crop_pixels(&image, rect),
            Err(CropError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn undecodable_source_signals_crop_failed() {
        assert!(matches!(
            LocalImage::decode(b"not an image".to_vec()),
            Err(CropError::CropFailed(_))
        ));
    }
}
