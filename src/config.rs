use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{DetectionParams, Strategy};
use crate::image_processing::ProcessingConfig;
use crate::partition::RegionSize;
use crate::suppress::validate_iou_threshold;
use crate::ConfigError;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_REGION_SIDE: u32 = 416;
pub const DEFAULT_STRIDE: u32 = 208;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
pub const DEFAULT_FUSION_IOU_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MAX_CONCURRENT_REGIONS: usize = 4;
pub const DEFAULT_MAX_REGIONS_PER_REQUEST: usize = 1024;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Traffic-sign classes that count as a warning.
pub const DEFAULT_RELEVANT_CLASSES: &[&str] = &[
    "Cấm ngược chiều",
    "Cấm dừng và đỗ",
    "Cấm rẽ",
    "Giới hạn tốc độ",
    "Cấm còn lại",
    "Nguy hiểm",
    "Hiệu lệnh",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_confidence_threshold: f32,
    pub default_strategy: Strategy,
    pub region_size: RegionSize,
    pub stride: u32,
    pub iou_threshold: f32,
    pub fusion_iou_threshold: f32,
    /// Upper bound on detector calls in flight, shared by all requests
    pub max_concurrent_regions: usize,
    pub max_regions_per_request: usize,
    pub request_timeout_ms: u64,
    pub relevant_classes: BTreeSet<String>,
    pub processing: ProcessingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            default_strategy: Strategy::Tiling,
            region_size: RegionSize::square(DEFAULT_REGION_SIDE),
            stride: DEFAULT_STRIDE,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            fusion_iou_threshold: DEFAULT_FUSION_IOU_THRESHOLD,
            max_concurrent_regions: DEFAULT_MAX_CONCURRENT_REGIONS,
            max_regions_per_request: DEFAULT_MAX_REGIONS_PER_REQUEST,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            relevant_classes: DEFAULT_RELEVANT_CLASSES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            processing: ProcessingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.default_confidence_threshold) {
            return Err(ConfigError::InvalidConfidenceThreshold(
                self.default_confidence_threshold,
            ));
        }
        self.region_size.validate()?;
        if self.stride == 0 {
            return Err(ConfigError::InvalidStride(self.stride));
        }
        validate_iou_threshold(self.iou_threshold)?;
        validate_iou_threshold(self.fusion_iou_threshold)?;
        if self.max_concurrent_regions == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        if self.max_regions_per_request == 0 {
            return Err(ConfigError::TooManyRegions { count: 1, max: 0 });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(())
    }

    /// Parses and validates a JSON document. Missing keys take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Request parameters built from the configured defaults.
    pub fn default_params(&self) -> DetectionParams {
        DetectionParams {
            strategy: self.default_strategy,
            region_size: self.region_size,
            stride: self.stride,
            iou_threshold: self.iou_threshold,
            fusion_iou_threshold: Some(self.fusion_iou_threshold),
            confidence_threshold: self.default_confidence_threshold,
            timeout_ms: None,
            roi: None,
        }
    }

    pub fn is_relevant(&self, class_name: &str) -> bool {
        self.relevant_classes.contains(class_name)
    }
}
