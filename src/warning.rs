use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detection::{Detection, DetectionSet};

pub const MESSAGE_SUCCESS: &str = "Success";
pub const MESSAGE_NO_WARNINGS: &str = "No relevant traffic warnings detected";

/// Traffic-warning view of a detection result.
///
/// `warnings` carries every detection. The relevant classes only decide the
/// message: [`MESSAGE_SUCCESS`] when at least one relevant detection is
/// present, [`MESSAGE_NO_WARNINGS`] otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningResponse {
    pub request_id: Uuid,
    pub warnings: Vec<Detection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<f64>,
    pub message: String,
}

impl WarningResponse {
    pub fn from_detections(
        detections: &DetectionSet,
        relevant_classes: &BTreeSet<String>,
        elapsed: Option<Duration>,
    ) -> Self {
        let relevant = relevant_detections(detections, relevant_classes);

        let message = if relevant.is_empty() {
            MESSAGE_NO_WARNINGS
        } else {
            MESSAGE_SUCCESS
        };

        Self {
            request_id: Uuid::new_v4(),
            warnings: detections.as_slice().to_vec(),
            processing_time_ms: elapsed.map(|d| d.as_secs_f64() * 1000.0),
            message: message.to_string(),
        }
    }

    /// Whether any relevant detection was found.
    pub fn has_relevant_warnings(&self) -> bool {
        self.message == MESSAGE_SUCCESS
    }
}

/// Detections whose class is in `relevant_classes`, in input order.
pub fn relevant_detections(detections: &DetectionSet, relevant_classes: &BTreeSet<String>) -> DetectionSet {
    detections
        .iter()
        .filter(|d| relevant_classes.contains(&d.class_name))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::geometry::BoundingBox;

    fn det(class_name: &str, confidence: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0).unwrap(),
            confidence,
            class_id: 0,
            class_name: class_name.into(),
        }
    }

    #[test]
    fn reports_every_detection_and_flags_relevant_ones() {
        let config = EngineConfig::default();
        let set: DetectionSet = vec![det("Cấm rẽ", 0.9), det("car", 0.8), det("Nguy hiểm", 0.7)].into();

        let response = WarningResponse::from_detections(&set, &config.relevant_classes, None);
        let classes: Vec<&str> = response.warnings.iter().map(|d| d.class_name.as_str()).collect();
        assert_eq!(classes, vec!["Cấm rẽ", "car", "Nguy hiểm"]);
        assert_eq!(response.message, MESSAGE_SUCCESS);
        assert!(response.has_relevant_warnings());
        assert!(response.processing_time_ms.is_none());

        assert_eq!(relevant_detections(&set, &config.relevant_classes).len(), 2);
    }

    #[test]
    fn no_relevant_detections_sets_message() {
        let config = EngineConfig::default();
        let set: DetectionSet = vec![det("car", 0.8)].into();

        let response =
            WarningResponse::from_detections(&set, &config.relevant_classes, Some(Duration::from_millis(12)));
        // non-relevant detections are still reported
        assert_eq!(response.warnings.len(), 1);
        assert_eq!(response.warnings[0].class_name, "car");
        assert_eq!(response.message, MESSAGE_NO_WARNINGS);
        assert!(!response.has_relevant_warnings());
        assert_eq!(response.processing_time_ms, Some(12.0));
    }

    #[test]
    fn serializes_boxes_as_arrays() {
        let relevant: BTreeSet<String> = ["Hiệu lệnh".to_string()].into();
        let set: DetectionSet = vec![det("Hiệu lệnh", 0.5)].into();
        let response = WarningResponse::from_detections(&set, &relevant, None);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["warnings"][0]["box"], serde_json::json!([0.0, 0.0, 10.0, 10.0]));
        assert_eq!(json["message"], "Success");
        assert!(json.get("processing_time_ms").is_none());

        let back: WarningResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back, response);
    }
}
