use serde::{Deserialize, Serialize};

use crate::geometry::BoundingBox;

/// Detection as reported by a detector for a single region.
///
/// Coordinates are region-local and unvalidated; the remapper drops
/// degenerate boxes instead of propagating them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    /// Bounding box [x1, y1, x2, y2] in region pixels
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
    /// Detection confidence score (0.0..1.0)
    pub confidence: f32,
    pub class_id: u32,
    pub class_name: String,
}

impl RawDetection {
    pub fn new(bbox: [f32; 4], confidence: f32, class_id: u32, class_name: impl Into<String>) -> Self {
        Self {
            bbox,
            confidence,
            class_id,
            class_name: class_name.into(),
        }
    }
}

/// Detection in source-image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[must_use]
pub struct Detection {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: u32,
    pub class_name: String,
}

/// Unordered collection of detections accumulated across regions.
///
/// Only grows by accumulation. Suppression reads a set and returns a new one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionSet(Vec<Detection>);

impl DetectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    pub fn push(&mut self, detection: Detection) {
        self.0.push(detection);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Detection] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Detection> {
        self.0
    }

    /// Highest-confidence detection, first one wins on ties.
    pub fn best(&self) -> Option<&Detection> {
        self.0.iter().reduce(|best, d| {
            if d.confidence > best.confidence {
                d
            } else {
                best
            }
        })
    }
}

impl From<Vec<Detection>> for DetectionSet {
    fn from(detections: Vec<Detection>) -> Self {
        Self(detections)
    }
}

impl Extend<Detection> for DetectionSet {
    fn extend<T: IntoIterator<Item = Detection>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl FromIterator<Detection> for DetectionSet {
    fn from_iter<T: IntoIterator<Item = Detection>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for DetectionSet {
    type Item = Detection;
    type IntoIter = std::vec::IntoIter<Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a DetectionSet {
    type Item = &'a Detection;
    type IntoIter = std::slice::Iter<'a, Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
