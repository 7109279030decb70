use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageEncoder, ImageReader, Limits, Rgb, RgbImage};
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::partition::RegionRect;
use crate::ConfigError;

#[derive(Debug, Error)]
pub enum ImageProcessingError {
    #[error("failed to decode image: {source}")]
    Decode {
        #[from]
        source: image::ImageError,
    },

    #[error("region encoding failed: width={width}, height={height}, reason={reason}")]
    Encode {
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("image too large: {width}x{height} = {pixels} pixels, max {max_pixels}")]
    ImageTooLarge {
        width: u32,
        height: u32,
        pixels: u64,
        max_pixels: u64,
    },

    #[error("input too large: {size} bytes, max {max_size}")]
    InputTooLarge { size: usize, max_size: usize },

    #[error("invalid image dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("input bytes empty")]
    EmptyInput,

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("crop failed: {0}")]
    Crop(#[from] ConfigError),
}

/// Limits applied while decoding untrusted frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub max_image_pixels: u64,
    pub max_input_bytes: usize,
    pub max_alloc_bytes: u64,
    pub max_dimension: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_image_pixels: 100_000_000,
            max_input_bytes: 50 * 1024 * 1024,
            max_alloc_bytes: 512 * 1024 * 1024,
            max_dimension: 15_000,
        }
    }
}

/// Byte encoding for regions handed to detectors that consume encoded images.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionEncoding {
    Png,
    Jpeg { quality: u8 },
    /// Lossless WebP
    WebP,
}

/// Decodes raw bytes into an RGB pixel grid, enforcing `config` limits.
#[instrument(skip(config, raw_bytes), fields(input_size = raw_bytes.len()))]
pub fn decode_image(
    config: &ProcessingConfig,
    raw_bytes: &[u8],
) -> Result<RgbImage, ImageProcessingError> {
    if raw_bytes.is_empty() {
        return Err(ImageProcessingError::EmptyInput);
    }

    if raw_bytes.len() > config.max_input_bytes {
        return Err(ImageProcessingError::InputTooLarge {
            size: raw_bytes.len(),
            max_size: config.max_input_bytes,
        });
    }

    let mut reader = ImageReader::new(Cursor::new(raw_bytes))
        .with_guessed_format()
        .map_err(|e| ImageProcessingError::Decode { source: e.into() })?;

    if reader.format().is_none() {
        return Err(ImageProcessingError::UnsupportedFormat);
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(config.max_dimension);
    limits.max_image_height = Some(config.max_dimension);
    limits.max_alloc = Some(config.max_alloc_bytes);
    reader.limits(limits);

    let img = reader.decode()?;
    let (w, h) = (img.width(), img.height());

    if w == 0 || h == 0 {
        return Err(ImageProcessingError::InvalidDimensions { width: w, height: h });
    }

    let pixels = u64::from(w) * u64::from(h);
    if pixels > config.max_image_pixels {
        return Err(ImageProcessingError::ImageTooLarge {
            width: w,
            height: h,
            pixels,
            max_pixels: config.max_image_pixels,
        });
    }

    debug!(width = w, height = h, "image decoded");
    Ok(img.to_rgb8())
}

/// Encodes region pixels for a byte-oriented detector.
pub fn encode_region(
    pixels: &RgbImage,
    encoding: RegionEncoding,
) -> Result<Vec<u8>, ImageProcessingError> {
    let (width, height) = pixels.dimensions();

    if width == 0 || height == 0 {
        return Err(ImageProcessingError::Encode {
            width,
            height,
            reason: "zero dimension".into(),
        });
    }

    let mut buffer = Vec::with_capacity((width * height * 3) as usize / 8);
    let result = match encoding {
        RegionEncoding::Png => PngEncoder::new(&mut buffer).write_image(
            pixels.as_raw(),
            width,
            height,
            ExtendedColorType::Rgb8,
        ),
        RegionEncoding::Jpeg { quality } => JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
            .write_image(pixels.as_raw(), width, height, ExtendedColorType::Rgb8),
        RegionEncoding::WebP => WebPEncoder::new_lossless(&mut buffer).write_image(
            pixels.as_raw(),
            width,
            height,
            ExtendedColorType::Rgb8,
        ),
    };

    result.map_err(|e| ImageProcessingError::Encode {
        width,
        height,
        reason: e.to_string(),
    })?;

    Ok(buffer)
}

/// Scale and padding applied by [`letterbox`], kept so boxes found in the
/// letterboxed frame can be mapped back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxTransform {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub source_width: u32,
    pub source_height: u32,
}

impl LetterboxTransform {
    /// Maps a `[x1, y1, x2, y2]` box from letterboxed space to source pixels,
    /// clamped to the source extent.
    #[must_use]
    pub fn to_source(&self, bbox: [f32; 4]) -> [f32; 4] {
        let w = self.source_width as f32;
        let h = self.source_height as f32;
        [
            ((bbox[0] - self.pad_x) / self.scale).clamp(0.0, w),
            ((bbox[1] - self.pad_y) / self.scale).clamp(0.0, h),
            ((bbox[2] - self.pad_x) / self.scale).clamp(0.0, w),
            ((bbox[3] - self.pad_y) / self.scale).clamp(0.0, h),
        ]
    }
}

/// Resizes `img` to fit `target_w x target_h` preserving aspect ratio and
/// centres it on a canvas filled with `fill`.
pub fn letterbox(
    img: &RgbImage,
    target_w: u32,
    target_h: u32,
    fill: Rgb<u8>,
) -> Result<(RgbImage, LetterboxTransform), ImageProcessingError> {
    let (orig_w, orig_h) = img.dimensions();
    if orig_w == 0 || orig_h == 0 {
        return Err(ImageProcessingError::InvalidDimensions {
            width: orig_w,
            height: orig_h,
        });
    }
    if target_w == 0 || target_h == 0 {
        return Err(ImageProcessingError::InvalidDimensions {
            width: target_w,
            height: target_h,
        });
    }

    let scale = (target_w as f32 / orig_w as f32).min(target_h as f32 / orig_h as f32);

    let new_w = ((orig_w as f32 * scale).round() as u32).clamp(1, target_w);
    let new_h = ((orig_h as f32 * scale).round() as u32).clamp(1, target_h);

    let resized = image::imageops::resize(img, new_w, new_h, FilterType::Triangle);

    let offset_x = (target_w - new_w) / 2;
    let offset_y = (target_h - new_h) / 2;

    let mut canvas = RgbImage::from_pixel(target_w, target_h, fill);
    image::imageops::replace(&mut canvas, &resized, i64::from(offset_x), i64::from(offset_y));

    Ok((
        canvas,
        LetterboxTransform {
            scale,
            pad_x: offset_x as f32,
            pad_y: offset_y as f32,
            source_width: orig_w,
            source_height: orig_h,
        },
    ))
}

/// Default trims for [`RegionOfInterest::roadside`].
pub const DEFAULT_ROI_LEFT: f32 = 0.3;
pub const DEFAULT_ROI_BOTTOM: f32 = 0.3;

/// Part of an image that detection is restricted to.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionOfInterest {
    /// Fractions of the width (left, right) or height (top, bottom)
    /// trimmed from each edge. Pixel counts are truncated.
    Percent {
        #[serde(default)]
        left: f32,
        #[serde(default)]
        right: f32,
        #[serde(default)]
        top: f32,
        #[serde(default)]
        bottom: f32,
    },
    /// Corners in pixels, end-exclusive. Clamped to the image.
    Pixels { x1: u32, y1: u32, x2: u32, y2: u32 },
}

impl RegionOfInterest {
    pub const fn trim_left_bottom(left: f32, bottom: f32) -> Self {
        Self::Percent {
            left,
            right: 0.0,
            top: 0.0,
            bottom,
        }
    }

    /// Drops the left and bottom edges, where roadside signs rarely are.
    pub const fn roadside() -> Self {
        Self::trim_left_bottom(DEFAULT_ROI_LEFT, DEFAULT_ROI_BOTTOM)
    }

    /// Checks what can be checked without knowing the image size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Self::Percent {
                left,
                right,
                top,
                bottom,
            } => {
                for (edge, value) in [("left", left), ("right", right), ("top", top), ("bottom", bottom)] {
                    if !(0.0..1.0).contains(&value) {
                        return Err(ConfigError::InvalidRoi(format!(
                            "{edge} trim must be in [0, 1), got {value}"
                        )));
                    }
                }
                if left + right >= 1.0 || top + bottom >= 1.0 {
                    return Err(ConfigError::InvalidRoi(format!(
                        "trims leave no area: left={left} right={right} top={top} bottom={bottom}"
                    )));
                }
                Ok(())
            }
            Self::Pixels { x1, y1, x2, y2 } => {
                if x2 <= x1 || y2 <= y1 {
                    return Err(ConfigError::InvalidRoi(format!("empty box ({x1}, {y1}, {x2}, {y2})")));
                }
                Ok(())
            }
        }
    }

    /// Pixel rectangle of this region inside a `width` x `height` image.
    pub fn resolve(&self, width: u32, height: u32) -> Result<RegionRect, ConfigError> {
        self.validate()?;

        let rect = match *self {
            Self::Percent {
                left,
                right,
                top,
                bottom,
            } => {
                let trim = |dim: u32, fraction: f32| (f64::from(dim) * f64::from(fraction)) as u32;
                let (left, right) = (trim(width, left), trim(width, right));
                let (top, bottom) = (trim(height, top), trim(height, bottom));
                RegionRect {
                    x: left,
                    y: top,
                    width: width.saturating_sub(left).saturating_sub(right),
                    height: height.saturating_sub(top).saturating_sub(bottom),
                }
            }
            Self::Pixels { x1, y1, x2, y2 } => {
                let (x1, y1) = (x1.min(width), y1.min(height));
                let (x2, y2) = (x2.min(width).max(x1), y2.min(height).max(y1));
                RegionRect {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                }
            }
        };

        if rect.width == 0 || rect.height == 0 {
            return Err(ConfigError::InvalidRoi(format!(
                "{self:?} is empty on a {width}x{height} image"
            )));
        }
        Ok(rect)
    }
}

/// Copies the region of interest out of `image`. The returned rectangle is
/// the crop's placement in `image`; its origin maps crop coordinates back.
#[instrument(skip(image), fields(width = image.width(), height = image.height()))]
pub fn crop_roi(image: &RgbImage, roi: &RegionOfInterest) -> Result<(RgbImage, RegionRect), ImageProcessingError> {
    counter!("tilescan.roi.crops").increment(1);
    let rect = roi.resolve(image.width(), image.height())?;
    let cropped = image::imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image();
    debug!(?rect, "region of interest cropped");
    Ok((cropped, rect))
}
