use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::ConfigError;

/// Width and height of the regions fed to the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionSize {
    pub width: u32,
    pub height: u32,
}

impl RegionSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn square(side: u32) -> Self {
        Self::new(side, side)
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidRegionSize {
                width: self.width,
                height: self.height,
            });
        }
        Ok(self)
    }
}

/// Origin and valid (non-padded) extent of a region in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl RegionRect {
    pub fn origin(&self) -> (u32, u32) {
        (self.x, self.y)
    }
}

/// A tile or sliding window: rectangle plus zero-padded pixels of the full
/// region size.
#[derive(Debug, Clone)]
pub struct Region {
    /// Row-major position in the partition
    pub index: usize,
    pub rect: RegionRect,
    pub pixels: RgbImage,
}

impl Region {
    pub fn origin(&self) -> (u32, u32) {
        self.rect.origin()
    }
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub regions: Vec<Region>,
    /// (width, height) of the source image
    pub source_size: (u32, u32),
}

/// Region rectangles of one pass over an area of the source image.
///
/// Only the per-axis offsets are stored, so the region count is known
/// without building every rectangle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    bounds: RegionRect,
    size: RegionSize,
    xs: Vec<u32>,
    ys: Vec<u32>,
}

impl Layout {
    /// Tiles (`stride = None`) or sliding windows over `bounds`. Rectangles
    /// are reported in source pixels and never extend past `bounds`.
    pub fn new(bounds: RegionRect, size: RegionSize, stride: Option<u32>) -> Result<Self, ConfigError> {
        let size = size.validate()?;
        let (xs, ys) = match stride {
            None => (
                tile_offsets(bounds.width, size.width),
                tile_offsets(bounds.height, size.height),
            ),
            Some(stride) => (
                sliding_offsets(bounds.width, size.width, stride, "width")?,
                sliding_offsets(bounds.height, size.height, stride, "height")?,
            ),
        };
        Ok(Self { bounds, size, xs, ys })
    }

    pub fn region_size(&self) -> RegionSize {
        self.size
    }

    pub fn bounds(&self) -> RegionRect {
        self.bounds
    }

    pub fn columns(&self) -> usize {
        self.xs.len()
    }

    pub fn rows(&self) -> usize {
        self.ys.len()
    }

    pub fn len(&self) -> u64 {
        self.xs.len() as u64 * self.ys.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty() || self.ys.is_empty()
    }

    /// Rectangle at row-major `index`.
    pub fn rect(&self, index: u64) -> Option<RegionRect> {
        if index >= self.len() {
            return None;
        }
        let columns = self.xs.len() as u64;
        let col = (index % columns) as usize;
        let row = (index / columns) as usize;
        Some(self.rect_at(self.xs[col], self.ys[row]))
    }

    /// Rectangles in row-major order, y outer and x inner.
    pub fn rects(&self) -> impl Iterator<Item = RegionRect> + '_ {
        self.ys
            .iter()
            .flat_map(move |&y| self.xs.iter().map(move |&x| self.rect_at(x, y)))
    }

    fn rect_at(&self, x: u32, y: u32) -> RegionRect {
        RegionRect {
            x: self.bounds.x.saturating_add(x),
            y: self.bounds.y.saturating_add(y),
            width: self.size.width.min(self.bounds.width - x),
            height: self.size.height.min(self.bounds.height - y),
        }
    }
}

fn full_frame(width: u32, height: u32) -> RegionRect {
    RegionRect {
        x: 0,
        y: 0,
        width,
        height,
    }
}

fn tile_offsets(dimension: u32, tile: u32) -> Vec<u32> {
    (0..dimension).step_by(tile as usize).collect()
}

/// Non-overlapping tiles covering `width x height`, row-major.
pub fn tile_layout(width: u32, height: u32, size: RegionSize) -> Result<Layout, ConfigError> {
    Layout::new(full_frame(width, height), size, None)
}

/// Window start positions along one axis.
///
/// Steps by `stride` while the window fits, then adds one window flush with
/// the far edge if the last one stops short of it.
pub fn sliding_offsets(
    dimension: u32,
    window: u32,
    stride: u32,
    axis: &'static str,
) -> Result<Vec<u32>, ConfigError> {
    if stride == 0 {
        return Err(ConfigError::InvalidStride(stride));
    }
    if window > dimension {
        return Err(ConfigError::WindowExceedsImage {
            axis,
            window,
            dimension,
        });
    }

    let last_start = dimension - window;
    let mut offsets: Vec<u32> = (0..=last_start).step_by(stride as usize).collect();

    if let Some(&last) = offsets.last() {
        if last + window < dimension {
            offsets.push(last_start);
        }
    }
    Ok(offsets)
}

/// Overlapping windows over `width x height`, y outer and x inner.
pub fn window_layout(width: u32, height: u32, size: RegionSize, stride: u32) -> Result<Layout, ConfigError> {
    Layout::new(full_frame(width, height), size, Some(stride))
}

/// Splits `image` into regions. `stride = None` tiles without overlap,
/// `Some(stride)` slides a window.
#[instrument(skip(image), fields(width = image.width(), height = image.height()))]
pub fn partition(image: &RgbImage, size: RegionSize, stride: Option<u32>) -> Result<Partition, ConfigError> {
    let (width, height) = image.dimensions();
    let layout = Layout::new(full_frame(width, height), size, stride)?;

    let regions: Vec<Region> = layout
        .rects()
        .enumerate()
        .map(|(index, rect)| extract_region(image, index, rect, size))
        .collect();

    debug!(regions = regions.len(), ?stride, "image partitioned");

    Ok(Partition {
        regions,
        source_size: (width, height),
    })
}

pub fn tile(image: &RgbImage, size: RegionSize) -> Result<Partition, ConfigError> {
    partition(image, size, None)
}

pub fn sliding_window(image: &RgbImage, size: RegionSize, stride: u32) -> Result<Partition, ConfigError> {
    partition(image, size, Some(stride))
}

/// Copies `rect` out of `image` onto a zeroed canvas of the full region size.
pub fn extract_region(image: &RgbImage, index: usize, rect: RegionRect, size: RegionSize) -> Region {
    let mut canvas = RgbImage::new(size.width, size.height);
    let valid = image::imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image();
    image::imageops::replace(&mut canvas, &valid, 0, 0);
    Region {
        index,
        rect,
        pixels: canvas,
    }
}

/// Shape of a sliding-window layout over one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutStats {
    pub image_size: (u32, u32),
    pub window_size: RegionSize,
    pub stride: u32,
    pub total_windows: u64,
    pub windows_per_row: usize,
    pub windows_per_column: usize,
    pub overlap_percentage_x: f64,
    pub overlap_percentage_y: f64,
    /// Sum of window areas over image area
    pub coverage_efficiency: f64,
}

pub fn layout_stats(
    width: u32,
    height: u32,
    size: RegionSize,
    stride: u32,
) -> Result<LayoutStats, ConfigError> {
    let layout = window_layout(width, height, size, stride)?;
    let size = layout.region_size();
    let total = layout.len();

    let overlap = |window: u32| f64::from(window.saturating_sub(stride)) / f64::from(window) * 100.0;

    Ok(LayoutStats {
        image_size: (width, height),
        window_size: size,
        stride,
        total_windows: total,
        windows_per_row: layout.columns(),
        windows_per_column: layout.rows(),
        overlap_percentage_x: overlap(size.width),
        overlap_percentage_y: overlap(size.height),
        coverage_efficiency: (total as f64 * f64::from(size.width) * f64::from(size.height))
            / (f64::from(width) * f64::from(height)),
    })
}
