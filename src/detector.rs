//! Boundary to the object detector that runs on each region.
//!
//! Implementations are blocking: the engine calls them from
//! `tokio::task::spawn_blocking`, possibly from several threads at once.

use image::RgbImage;
use thiserror::Error;

use crate::detection::RawDetection;
use crate::partition::RegionSize;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("inference failed: {0}")]
    Inference(String),

    #[error("invalid model output: expected {expected}, got {got}")]
    InvalidOutput { expected: String, got: String },

    #[error("model configuration mismatch: {0}")]
    ModelMismatch(String),

    #[error("region preprocessing failed: {0}")]
    Preprocess(String),
}

/// Common interface for region detectors.
pub trait Detector: Send + Sync {
    /// Detects objects in one region.
    ///
    /// `region` is exactly `target_size` pixels, zero-padded at image edges.
    /// Returned boxes are in region pixel coordinates.
    fn detect(
        &self,
        region: &RgbImage,
        confidence_threshold: f32,
        target_size: RegionSize,
    ) -> Result<Vec<RawDetection>, DetectorError>;

    /// Detector name for logging
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<D: Detector + ?Sized> Detector for std::sync::Arc<D> {
    fn detect(
        &self,
        region: &RgbImage,
        confidence_threshold: f32,
        target_size: RegionSize,
    ) -> Result<Vec<RawDetection>, DetectorError> {
        (**self).detect(region, confidence_threshold, target_size)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Adapts a closure into a [`Detector`].
pub struct FnDetector<F> {
    name: String,
    f: F,
}

impl<F> FnDetector<F>
where
    F: Fn(&RgbImage, f32, RegionSize) -> Result<Vec<RawDetection>, DetectorError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Detector for FnDetector<F>
where
    F: Fn(&RgbImage, f32, RegionSize) -> Result<Vec<RawDetection>, DetectorError> + Send + Sync,
{
    fn detect(
        &self,
        region: &RgbImage,
        confidence_threshold: f32,
        target_size: RegionSize,
    ) -> Result<Vec<RawDetection>, DetectorError> {
        (self.f)(region, confidence_threshold, target_size)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
