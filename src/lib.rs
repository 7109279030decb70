// lib.rs - Partition & merge detection engine

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

pub mod config;
pub mod detection;
pub mod detector;
pub mod engine;
pub mod geometry;
pub mod image_processing;
pub mod partition;
pub mod remap;
pub mod suppress;
pub mod warning;

#[cfg(feature = "ml")]
pub mod onnx;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use config::EngineConfig;
pub use detection::{Detection, DetectionSet, RawDetection};
pub use detector::{Detector, DetectorError};
pub use engine::{CancelToken, DetectionOutcome, DetectionParams, PartitionEngine, Strategy};
pub use geometry::{iou, BoundingBox};
pub use image_processing::{ImageProcessingError, ProcessingConfig, RegionOfInterest};
pub use partition::{Layout, Partition, Region, RegionRect, RegionSize};
pub use suppress::{class_agnostic_nms, greedy_suppress, per_class_nms};
pub use warning::WarningResponse;

/// Invalid request parameters or engine configuration. Never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid strategy {0:?}, expected one of: tiling, sliding_window, both")]
    InvalidStrategy(String),

    #[error("invalid region size {width}x{height}, both sides must be > 0")]
    InvalidRegionSize { width: u32, height: u32 },

    #[error("invalid stride {0}, must be > 0")]
    InvalidStride(u32),

    #[error("window {axis} size {window} exceeds image {axis} dimension {dimension}")]
    WindowExceedsImage {
        axis: &'static str,
        window: u32,
        dimension: u32,
    },

    #[error("invalid iou threshold {0}, must be in [0.0, 1.0]")]
    InvalidIouThreshold(f32),

    #[error("invalid confidence threshold {0}, must be in [0.0, 1.0]")]
    InvalidConfidenceThreshold(f32),

    #[error("invalid box: x1={x1}, y1={y1}, x2={x2}, y2={y2}, reason={reason}")]
    InvalidBox {
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
        reason: &'static str,
    },

    #[error("partition produces {count} regions, max {max}")]
    TooManyRegions { count: u64, max: usize },

    #[error("invalid region of interest: {0}")]
    InvalidRoi(String),

    #[error("max_concurrent_regions must be > 0")]
    InvalidConcurrency,

    #[error("request timeout must be > 0")]
    InvalidTimeout,

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("decode error: {0}")]
    Decode(#[from] ImageProcessingError),

    #[error("inference failed for region {region_index} at ({origin_x}, {origin_y}): {source}")]
    Inference {
        region_index: usize,
        origin_x: u32,
        origin_y: u32,
        #[source]
        source: DetectorError,
    },

    #[error("detection timed out after {0:?}")]
    Timeout(Duration),

    #[error("detection cancelled")]
    Cancelled,

    #[error("worker failure: {0}")]
    Worker(String),
}

impl EngineError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Inference { .. } => ErrorKind::Inference,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Worker(_) => ErrorKind::Internal,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Configuration,
    Decode,
    Inference,
    Timeout,
    Cancelled,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Configuration => "CONFIGURATION_ERROR",
            Self::Decode => "DECODE_ERROR",
            Self::Inference => "INFERENCE_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// The engine itself never retries; this only tells a caller whether
    /// resubmitting the same request could succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::Cancelled)
    }

    #[must_use]
    pub const fn http_status_hint(self) -> Option<u16> {
        match self {
            Self::Configuration | Self::Decode => Some(400),
            Self::Timeout => Some(504),
            Self::Inference | Self::Internal => Some(500),
            Self::Cancelled => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_codes() {
        let err = EngineError::from(ConfigError::InvalidStride(0));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.kind().code(), "CONFIGURATION_ERROR");
        assert_eq!(err.kind().http_status_hint(), Some(400));
        assert!(!err.kind().is_retryable());
    }

    #[test]
    fn timeout_is_retryable() {
        let err = EngineError::Timeout(Duration::from_secs(1));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.kind().is_retryable());
        assert_eq!(err.kind().http_status_hint(), Some(504));
    }

    #[test]
    fn inference_error_mentions_region() {
        let err = EngineError::Inference {
            region_index: 3,
            origin_x: 416,
            origin_y: 0,
            source: DetectorError::Inference("boom".into()),
        };
        let text = err.to_string();
        assert!(text.contains("region 3"));
        assert!(text.contains("(416, 0)"));
        assert_eq!(err.kind(), ErrorKind::Inference);
    }
}
