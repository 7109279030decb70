//! Partition, detect and merge.
//!
//! The engine splits an image into regions, runs the detector on every
//! region through a bounded pool of blocking workers, translates the
//! results back into source coordinates and suppresses duplicates.
//!
//! Any region failure aborts the whole request; partial results are never
//! returned.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::detection::{Detection, DetectionSet};
use crate::detector::Detector;
use crate::image_processing::{decode_image, RegionOfInterest};
use crate::partition::{extract_region, Layout, Region, RegionRect, RegionSize};
use crate::remap::remap;
use crate::suppress::{class_agnostic_nms, per_class_nms, validate_iou_threshold};
use crate::{ConfigError, EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Tiling,
    SlidingWindow,
    Both,
}

impl Strategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tiling => "tiling",
            Self::SlidingWindow => "sliding_window",
            Self::Both => "both",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tiling" => Ok(Self::Tiling),
            "sliding_window" => Ok(Self::SlidingWindow),
            "both" => Ok(Self::Both),
            other => Err(ConfigError::InvalidStrategy(other.to_string())),
        }
    }
}

/// Per-request detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionParams {
    pub strategy: Strategy,
    pub region_size: RegionSize,
    /// Window step for the sliding-window pass. Ignored by tiling.
    pub stride: u32,
    /// Per-class suppression threshold inside each pass
    pub iou_threshold: f32,
    /// Class-agnostic threshold used to fuse both passes. Falls back to
    /// `iou_threshold` when unset. [`DetectionParams::new`] leaves it unset;
    /// [`EngineConfig::default_params`] fills in the configured value.
    #[serde(default)]
    pub fusion_iou_threshold: Option<f32>,
    pub confidence_threshold: f32,
    /// Overrides the engine's request timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Restricts partitioning to part of the image. Boxes are still
    /// reported in full-image coordinates.
    #[serde(default)]
    pub roi: Option<RegionOfInterest>,
}

impl Default for DetectionParams {
    fn default() -> Self {
        EngineConfig::default().default_params()
    }
}

impl DetectionParams {
    pub fn new(strategy: Strategy, region_size: RegionSize) -> Self {
        Self {
            strategy,
            region_size,
            fusion_iou_threshold: None,
            roi: None,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_stride(mut self, stride: u32) -> Self {
        self.stride = stride;
        self
    }

    #[must_use]
    pub fn with_iou_threshold(mut self, iou_threshold: f32) -> Self {
        self.iou_threshold = iou_threshold;
        self
    }

    #[must_use]
    pub fn with_fusion_iou_threshold(mut self, iou_threshold: f32) -> Self {
        self.fusion_iou_threshold = Some(iou_threshold);
        self
    }

    #[must_use]
    pub fn with_confidence_threshold(mut self, confidence_threshold: f32) -> Self {
        self.confidence_threshold = confidence_threshold;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    #[must_use]
    pub fn with_roi(mut self, roi: RegionOfInterest) -> Self {
        self.roi = Some(roi);
        self
    }

    pub fn fusion_threshold(&self) -> f32 {
        self.fusion_iou_threshold.unwrap_or(self.iou_threshold)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.region_size.validate()?;
        if self.strategy != Strategy::Tiling && self.stride == 0 {
            return Err(ConfigError::InvalidStride(self.stride));
        }
        validate_iou_threshold(self.iou_threshold)?;
        validate_iou_threshold(self.fusion_threshold())?;
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::InvalidConfidenceThreshold(self.confidence_threshold));
        }
        if self.timeout_ms == Some(0) {
            return Err(ConfigError::InvalidTimeout);
        }
        if let Some(roi) = &self.roi {
            roi.validate()?;
        }
        Ok(())
    }
}

/// Cooperative cancellation signal shared between a caller and a request.
///
/// Cancelling stops waiting on the request immediately. Detector calls
/// already running on a blocking thread finish on their own; their
/// results are discarded.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // the sender lives in self, so the channel cannot close here
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

/// Detections for one decoded request together with its wall time.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionOutcome {
    pub detections: DetectionSet,
    pub elapsed: Duration,
}

impl DetectionOutcome {
    pub fn processing_time_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

/// Runs partitioned detection requests.
///
/// The worker pool is shared by every request on the same engine:
/// `max_concurrent_regions` bounds detector calls across all of them.
pub struct PartitionEngine {
    config: EngineConfig,
    semaphore: Arc<Semaphore>,
}

impl PartitionEngine {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_regions));
        Ok(Self { config, semaphore })
    }

    pub fn with_defaults() -> Self {
        let config = EngineConfig::default();
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_regions));
        Self { config, semaphore }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Worker slots not currently held by a detector call.
    pub fn available_workers(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Partitions `image`, runs `detector` on every region and merges the
    /// results into one set in source-image coordinates.
    ///
    /// Returns the first failure and drops every other result: a failed
    /// region, the timeout or `cancel` firing all abort the request.
    ///
    /// Parameters and the region limit are checked before the image is
    /// copied for the workers; [`detect_shared`](Self::detect_shared)
    /// skips the copy.
    pub async fn detect_partitioned(
        &self,
        image: &RgbImage,
        params: &DetectionParams,
        detector: Arc<dyn Detector>,
        cancel: Option<&CancelToken>,
    ) -> EngineResult<DetectionSet> {
        self.instrumented(image.dimensions(), params, detector, cancel, || Arc::new(image.clone()))
            .await
    }

    /// [`detect_partitioned`](Self::detect_partitioned) over an image the
    /// caller already shares.
    pub async fn detect_shared(
        &self,
        image: Arc<RgbImage>,
        params: &DetectionParams,
        detector: Arc<dyn Detector>,
        cancel: Option<&CancelToken>,
    ) -> EngineResult<DetectionSet> {
        self.instrumented(image.dimensions(), params, detector, cancel, || image)
            .await
    }

    /// Decodes an encoded image off the async runtime, then runs
    /// [`detect_shared`](Self::detect_shared) on it.
    pub async fn detect_bytes(
        &self,
        bytes: Vec<u8>,
        params: &DetectionParams,
        detector: Arc<dyn Detector>,
        cancel: Option<&CancelToken>,
    ) -> EngineResult<DetectionOutcome> {
        let start = Instant::now();
        let processing = self.config.processing.clone();

        let image = tokio::task::spawn_blocking(move || decode_image(&processing, &bytes))
            .await
            .map_err(worker_error)??;

        let detections = self
            .detect_shared(Arc::new(image), params, detector, cancel)
            .await?;

        Ok(DetectionOutcome {
            detections,
            elapsed: start.elapsed(),
        })
    }

    #[instrument(
        skip(self, params, detector, cancel, image),
        fields(
            width = dimensions.0,
            height = dimensions.1,
            strategy = %params.strategy,
            detector = detector.name(),
        )
    )]
    async fn instrumented(
        &self,
        dimensions: (u32, u32),
        params: &DetectionParams,
        detector: Arc<dyn Detector>,
        cancel: Option<&CancelToken>,
        image: impl FnOnce() -> Arc<RgbImage>,
    ) -> EngineResult<DetectionSet> {
        let start = Instant::now();
        counter!("tilescan.requests", "strategy" => params.strategy.as_str()).increment(1);

        let result = self.run(dimensions, params, detector, cancel, image).await;

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        histogram!("tilescan.detect.duration_ms").record(elapsed_ms);

        match &result {
            Ok(set) => debug!(detections = set.len(), elapsed_ms, "partitioned detection complete"),
            Err(e) => {
                counter!("tilescan.errors", "kind" => e.kind().code()).increment(1);
                warn!(error = %e, elapsed_ms, "partitioned detection failed");
            }
        }

        result
    }

    async fn run(
        &self,
        dimensions: (u32, u32),
        params: &DetectionParams,
        detector: Arc<dyn Detector>,
        cancel: Option<&CancelToken>,
        image: impl FnOnce() -> Arc<RgbImage>,
    ) -> EngineResult<DetectionSet> {
        params.validate()?;
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(EngineError::Cancelled);
        }

        let strides = match params.strategy {
            Strategy::Tiling => vec![None],
            Strategy::SlidingWindow => vec![Some(params.stride)],
            Strategy::Both => vec![None, Some(params.stride)],
        };
        let layouts = self.layouts(dimensions, params, &strides)?;
        let image = image();

        let timeout = params
            .timeout_ms
            .map_or_else(|| self.config.request_timeout(), Duration::from_millis);

        let work = tokio::time::timeout(timeout, self.run_layouts(image, layouts, params, detector));

        tokio::select! {
            biased;
            () = wait_cancelled(cancel) => Err(EngineError::Cancelled),
            outcome = work => outcome.map_err(|_| EngineError::Timeout(timeout))?,
        }
    }

    /// Runs one pass per layout. Two passes are fused with class-agnostic
    /// suppression.
    async fn run_layouts(
        &self,
        image: Arc<RgbImage>,
        layouts: Vec<Layout>,
        params: &DetectionParams,
        detector: Arc<dyn Detector>,
    ) -> EngineResult<DetectionSet> {
        let mut layouts = layouts.into_iter();
        let (first, second) = (layouts.next(), layouts.next());
        match (first, second) {
            (Some(tiles), Some(windows)) => {
                let (tiled, windowed) = tokio::try_join!(
                    self.run_pass(Arc::clone(&image), tiles, params, Arc::clone(&detector)),
                    self.run_pass(image, windows, params, detector),
                )?;

                let mut combined = DetectionSet::with_capacity(tiled.len() + windowed.len());
                combined.extend(tiled);
                combined.extend(windowed);

                let threshold = params.fusion_threshold();
                let fused = tokio::task::spawn_blocking(move || class_agnostic_nms(&combined, threshold))
                    .await
                    .map_err(worker_error)??;
                Ok(fused)
            }
            (Some(layout), None) => self.run_pass(image, layout, params, detector).await,
            _ => Ok(DetectionSet::new()),
        }
    }

    /// Lays out every pass over the region of interest and checks the
    /// region limit. Only per-axis offsets are built here; region pixels
    /// are copied later by the workers.
    fn layouts(
        &self,
        (width, height): (u32, u32),
        params: &DetectionParams,
        strides: &[Option<u32>],
    ) -> Result<Vec<Layout>, ConfigError> {
        let bounds = match &params.roi {
            Some(roi) => roi.resolve(width, height)?,
            None => RegionRect {
                x: 0,
                y: 0,
                width,
                height,
            },
        };

        let layouts = strides
            .iter()
            .map(|stride| Layout::new(bounds, params.region_size, *stride))
            .collect::<Result<Vec<_>, _>>()?;

        let count: u64 = layouts.iter().map(Layout::len).sum();
        let max = self.config.max_regions_per_request;
        if count > max as u64 {
            return Err(ConfigError::TooManyRegions { count, max });
        }

        debug!(regions = count, ?bounds, "partition laid out");
        Ok(layouts)
    }

    /// Detects over one pass's regions and applies per-class suppression.
    async fn run_pass(
        &self,
        image: Arc<RgbImage>,
        layout: Layout,
        params: &DetectionParams,
        detector: Arc<dyn Detector>,
    ) -> EngineResult<DetectionSet> {
        let accumulated = self.detect_regions(image, &layout, params, detector).await?;
        let threshold = params.iou_threshold;
        let merged = tokio::task::spawn_blocking(move || per_class_nms(&accumulated, threshold))
            .await
            .map_err(worker_error)??;
        Ok(merged)
    }

    /// Fans regions out to the worker pool and gathers remapped detections
    /// in region order, whatever order the workers finish in.
    ///
    /// A region's pixels are only extracted once its task holds a worker
    /// permit, so at most `max_concurrent_regions` region buffers exist.
    async fn detect_regions(
        &self,
        image: Arc<RgbImage>,
        layout: &Layout,
        params: &DetectionParams,
        detector: Arc<dyn Detector>,
    ) -> EngineResult<DetectionSet> {
        // bounded by max_regions_per_request
        let count = layout.len() as usize;
        counter!("tilescan.regions").increment(count as u64);

        let confidence = params.confidence_threshold;
        let size = layout.region_size();

        // Dropping the set on an early return aborts tasks still waiting
        // for a permit.
        let mut tasks = JoinSet::new();
        for (index, rect) in layout.rects().enumerate() {
            let semaphore = Arc::clone(&self.semaphore);
            let detector = Arc::clone(&detector);
            let image = Arc::clone(&image);
            tasks.spawn(async move {
                let permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| EngineError::Worker(e.to_string()))?;
                tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    let region = extract_region(&image, index, rect, size);
                    detect_region(detector.as_ref(), &region, confidence, size)
                })
                .await
                .map_err(worker_error)?
            });
        }

        let mut per_region: Vec<Vec<Detection>> = vec![Vec::new(); count];
        while let Some(joined) = tasks.join_next().await {
            let (index, detections) = joined.map_err(worker_error)??;
            per_region[index] = detections;
        }

        Ok(per_region.into_iter().flatten().collect())
    }
}

fn detect_region(
    detector: &dyn Detector,
    region: &Region,
    confidence_threshold: f32,
    target: RegionSize,
) -> EngineResult<(usize, Vec<Detection>)> {
    let (origin_x, origin_y) = region.origin();
    let raw = detector
        .detect(&region.pixels, confidence_threshold, target)
        .map_err(|source| EngineError::Inference {
            region_index: region.index,
            origin_x,
            origin_y,
            source,
        })?;
    Ok((region.index, remap(&raw, (origin_x, origin_y))))
}

async fn wait_cancelled(cancel: Option<&CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn worker_error(err: JoinError) -> EngineError {
    if err.is_panic() {
        EngineError::Worker("detection worker panicked".to_string())
    } else {
        EngineError::Worker(err.to_string())
    }
}
