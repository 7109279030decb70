use metrics::counter;
use tracing::debug;

use crate::detection::{Detection, RawDetection};
use crate::geometry::BoundingBox;

/// Translates region-local detections into source-image coordinates.
///
/// Degenerate or non-finite boxes and NaN confidences are dropped. Finite
/// confidences are clamped into `[0, 1]`. The input is left untouched.
pub fn remap(raw: &[RawDetection], origin: (u32, u32)) -> Vec<Detection> {
    let (ox, oy) = (origin.0 as f32, origin.1 as f32);
    let mut out = Vec::with_capacity(raw.len());

    for det in raw {
        if det.confidence.is_nan() {
            debug!(class_name = %det.class_name, "dropping detection with NaN confidence");
            counter!("tilescan.remap.dropped").increment(1);
            continue;
        }

        let [x1, y1, x2, y2] = det.bbox;
        let Ok(bbox) = BoundingBox::new(x1 + ox, y1 + oy, x2 + ox, y2 + oy) else {
            debug!(bbox = ?det.bbox, class_name = %det.class_name, "dropping degenerate box");
            counter!("tilescan.remap.dropped").increment(1);
            continue;
        };

        out.push(Detection {
            bbox,
            confidence: det.confidence.clamp(0.0, 1.0),
            class_id: det.class_id,
            class_name: det.class_name.clone(),
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn raw(bbox: [f32; 4], confidence: f32) -> RawDetection {
        RawDetection::new(bbox, confidence, 3, "Cấm rẽ")
    }

    #[test]
    fn translates_by_origin() {
        let input = vec![raw([10.0, 20.0, 50.0, 60.0], 0.8)];
        let out = remap(&input, (416, 832));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bbox.as_array(), [426.0, 852.0, 466.0, 892.0]);
        assert_eq!(out[0].confidence, 0.8);
        assert_eq!(out[0].class_id, 3);
        assert_eq!(out[0].class_name, "Cấm rẽ");
        // input untouched
        assert_eq!(input[0].bbox, [10.0, 20.0, 50.0, 60.0]);
    }

    #[test]
    fn drops_degenerate_boxes() {
        let input = vec![
            raw([10.0, 10.0, 10.0, 20.0], 0.9),
            raw([30.0, 10.0, 20.0, 20.0], 0.9),
            raw([0.0, 0.0, 5.0, 5.0], 0.9),
        ];
        let out = remap(&input, (0, 0));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bbox.as_array(), [0.0, 0.0, 5.0, 5.0]);
    }

    #[test]
    fn drops_non_finite_values() {
        let input = vec![
            raw([f32::NAN, 0.0, 5.0, 5.0], 0.9),
            raw([0.0, 0.0, f32::INFINITY, 5.0], 0.9),
            raw([0.0, 0.0, 5.0, 5.0], f32::NAN),
        ];
        assert!(remap(&input, (10, 10)).is_empty());
    }

    #[test]
    fn clamps_confidence() {
        let out = remap(&[raw([0.0, 0.0, 5.0, 5.0], 1.2)], (0, 0));
        assert_eq!(out[0].confidence, 1.0);
    }

    proptest! {
        #[test]
        fn remap_preserves_size_and_shifts_origin(
            x in 0.0f32..400.0,
            y in 0.0f32..400.0,
            w in 1.0f32..100.0,
            h in 1.0f32..100.0,
            ox in 0u32..4000,
            oy in 0u32..4000,
        ) {
            let out = remap(&[raw([x, y, x + w, y + h], 0.5)], (ox, oy));
            prop_assert_eq!(out.len(), 1);
            let b = out[0].bbox;
            prop_assert!((b.x1() - (x + ox as f32)).abs() < 1e-2);
            prop_assert!((b.y1() - (y + oy as f32)).abs() < 1e-2);
            prop_assert!((b.width() - w).abs() < 1e-2);
            prop_assert!((b.height() - h).abs() < 1e-2);
        }
    }
}
