use std::collections::HashMap;

use metrics::histogram;
use tracing::debug;

use crate::detection::{Detection, DetectionSet};
use crate::geometry;
use crate::ConfigError;

pub fn validate_iou_threshold(iou_threshold: f32) -> Result<f32, ConfigError> {
    if !(0.0..=1.0).contains(&iou_threshold) {
        return Err(ConfigError::InvalidIouThreshold(iou_threshold));
    }
    Ok(iou_threshold)
}

/// Greedy non-maximum suppression.
///
/// Candidates are visited by descending confidence; ties keep their input
/// order. Each kept detection removes every later candidate whose IoU with
/// it is `>= iou_threshold`. Survivors come back in visiting order.
pub fn greedy_suppress(detections: &[Detection], iou_threshold: f32) -> Result<Vec<Detection>, ConfigError> {
    let iou_threshold = validate_iou_threshold(iou_threshold)?;
    Ok(suppress_sorted(detections, iou_threshold))
}

fn suppress_sorted(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return Vec::new();
    }

    let mut order: Vec<usize> = (0..detections.len()).collect();
    // sort_by is stable
    order.sort_by(|&a, &b| detections[b].confidence.total_cmp(&detections[a].confidence));

    let boxes: Vec<[f32; 4]> = detections.iter().map(|d| d.bbox.as_array()).collect();
    let mut suppressed = vec![false; detections.len()];
    let mut keep = Vec::with_capacity(detections.len().min(100));

    for (pos, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);

        for &j in &order[pos + 1..] {
            if !suppressed[j] && geometry::iou(&boxes[i], &boxes[j]) >= iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    histogram!("tilescan.suppress.removed").record((detections.len() - keep.len()) as f64);

    keep.into_iter().map(|i| detections[i].clone()).collect()
}

/// NMS within each `class_name` group independently.
///
/// Groups are emitted in first-seen order; the result is meant to be
/// treated as unordered.
pub fn per_class_nms(detections: &DetectionSet, iou_threshold: f32) -> Result<DetectionSet, ConfigError> {
    let iou_threshold = validate_iou_threshold(iou_threshold)?;

    let mut group_index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<Vec<Detection>> = Vec::new();

    for det in detections {
        let idx = *group_index.entry(det.class_name.as_str()).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[idx].push(det.clone());
    }

    let survivors: DetectionSet = groups
        .iter()
        .flat_map(|group| suppress_sorted(group, iou_threshold))
        .collect();

    debug!(
        input = detections.len(),
        output = survivors.len(),
        classes = groups.len(),
        "per-class nms"
    );

    Ok(survivors)
}

/// NMS over all detections regardless of class label.
pub fn class_agnostic_nms(detections: &DetectionSet, iou_threshold: f32) -> Result<DetectionSet, ConfigError> {
    let survivors: DetectionSet = greedy_suppress(detections.as_slice(), iou_threshold)?.into();

    debug!(
        input = detections.len(),
        output = survivors.len(),
        "class-agnostic nms"
    );

    Ok(survivors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoundingBox;
    use proptest::prelude::*;

    fn det(bbox: [f32; 4], confidence: f32, class_name: &str) -> Detection {
        Detection {
            bbox: BoundingBox::try_from(bbox).unwrap(),
            confidence,
            class_id: 0,
            class_name: class_name.into(),
        }
    }

    #[test]
    fn empty_input_gives_empty_output() {
        assert!(greedy_suppress(&[], 0.5).unwrap().is_empty());
        assert!(per_class_nms(&DetectionSet::new(), 0.5).unwrap().is_empty());
    }

    #[test]
    fn overlapping_pair_keeps_higher_confidence() {
        let dets = vec![
            det([10.0, 10.0, 110.0, 110.0], 0.8, "car"),
            det([0.0, 0.0, 100.0, 100.0], 0.9, "car"),
        ];
        let out = greedy_suppress(&dets, 0.5).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 0.9);
        assert_eq!(out[0].bbox.as_array(), [0.0, 0.0, 100.0, 100.0]);
    }

    #[test]
    fn threshold_is_inclusive() {
        // iou == 0.5 exactly: [0,0,2,1] vs [0,0,1,1] -> 1 / 2
        let dets = vec![
            det([0.0, 0.0, 2.0, 1.0], 0.9, "a"),
            det([0.0, 0.0, 1.0, 1.0], 0.8, "a"),
        ];
        assert_eq!(greedy_suppress(&dets, 0.5).unwrap().len(), 1);
        assert_eq!(greedy_suppress(&dets, 0.51).unwrap().len(), 2);
    }

    #[test]
    fn ties_keep_accumulation_order() {
        let dets = vec![
            det([0.0, 0.0, 10.0, 10.0], 0.7, "first"),
            det([1.0, 1.0, 11.0, 11.0], 0.7, "second"),
        ];
        let out = greedy_suppress(&dets, 0.3).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_name, "first");
    }

    #[test]
    fn non_overlapping_boxes_survive() {
        let dets = vec![
            det([0.0, 0.0, 20.0, 20.0], 0.9, "a"),
            det([80.0, 80.0, 100.0, 100.0], 0.8, "a"),
        ];
        assert_eq!(greedy_suppress(&dets, 0.5).unwrap().len(), 2);
    }

    #[test]
    fn per_class_keeps_colocated_classes() {
        let set: DetectionSet = vec![
            det([0.0, 0.0, 100.0, 100.0], 0.9, "car"),
            det([2.0, 2.0, 100.0, 100.0], 0.8, "sign"),
            det([1.0, 1.0, 100.0, 100.0], 0.7, "car"),
        ]
        .into();
        let out = per_class_nms(&set, 0.5).unwrap();
        assert_eq!(out.len(), 2);
        let mut names: Vec<_> = out.iter().map(|d| d.class_name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["car", "sign"]);
    }

    #[test]
    fn class_agnostic_merges_across_classes() {
        let set: DetectionSet = vec![
            det([0.0, 0.0, 100.0, 100.0], 0.6, "car"),
            det([2.0, 2.0, 100.0, 100.0], 0.8, "sign"),
        ]
        .into();
        let out = class_agnostic_nms(&set, 0.5).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.as_slice()[0].class_name, "sign");
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        assert!(greedy_suppress(&[], 1.5).is_err());
        assert!(greedy_suppress(&[], -0.1).is_err());
        assert!(greedy_suppress(&[], f32::NAN).is_err());
        assert!(per_class_nms(&DetectionSet::new(), 2.0).is_err());
    }

    #[test]
    fn zero_threshold_keeps_only_best() {
        let dets = vec![
            det([0.0, 0.0, 10.0, 10.0], 0.5, "a"),
            det([50.0, 50.0, 60.0, 60.0], 0.9, "a"),
        ];
        let out = greedy_suppress(&dets, 0.0).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 0.9);
    }

    #[test]
    fn survivor_count_grows_with_threshold() {
        // Two clusters of nested boxes with decreasing overlap and no
        // suppression chains between clusters.
        let dets = vec![
            det([0.0, 0.0, 100.0, 100.0], 0.95, "a"),
            det([5.0, 5.0, 100.0, 100.0], 0.9, "a"),
            det([20.0, 20.0, 100.0, 100.0], 0.85, "a"),
            det([40.0, 40.0, 100.0, 100.0], 0.8, "a"),
            det([300.0, 300.0, 400.0, 400.0], 0.7, "a"),
            det([330.0, 330.0, 400.0, 400.0], 0.6, "a"),
        ];
        let mut previous = 0;
        for step in 0..=20 {
            let t = step as f32 / 20.0;
            let n = greedy_suppress(&dets, t).unwrap().len();
            assert!(n >= previous, "threshold {t}: {n} < {previous}");
            previous = n;
        }
        assert_eq!(previous, dets.len());
    }

    fn any_detection() -> impl Strategy<Value = Detection> {
        (
            0.0f32..300.0,
            0.0f32..300.0,
            1.0f32..120.0,
            1.0f32..120.0,
            0.0f32..1.0,
            prop::sample::select(vec!["car", "sign", "person"]),
        )
            .prop_map(|(x, y, w, h, c, name)| det([x, y, x + w, y + h], c, name))
    }

    proptest! {
        #[test]
        fn never_grows_and_keeps_best(
            dets in prop::collection::vec(any_detection(), 0..40),
            t in 0.0f32..=1.0,
        ) {
            let out = greedy_suppress(&dets, t).unwrap();
            prop_assert!(out.len() <= dets.len());
            if let Some(best) = DetectionSet::from(dets.clone()).best() {
                prop_assert_eq!(&out[0], best);
            }
        }

        #[test]
        fn survivors_do_not_overlap_beyond_threshold(
            dets in prop::collection::vec(any_detection(), 0..40),
            t in 0.05f32..=1.0,
        ) {
            let out = greedy_suppress(&dets, t).unwrap();
            for (i, a) in out.iter().enumerate() {
                for b in &out[i + 1..] {
                    prop_assert!(a.bbox.iou(&b.bbox) < t);
                }
            }
        }

        #[test]
        fn class_agnostic_is_idempotent(
            dets in prop::collection::vec(any_detection(), 0..40),
            t in 0.0f32..=1.0,
        ) {
            let once = class_agnostic_nms(&dets.into(), t).unwrap();
            let twice = class_agnostic_nms(&once, t).unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn per_class_never_mixes_classes(
            dets in prop::collection::vec(any_detection(), 0..40),
            t in 0.0f32..=1.0,
        ) {
            let set = DetectionSet::from(dets);
            let out = per_class_nms(&set, t).unwrap();
            prop_assert!(out.len() <= set.len());
            for name in ["car", "sign", "person"] {
                let input: Vec<_> = set.iter().filter(|d| d.class_name == name).cloned().collect();
                let expected = greedy_suppress(&input, t).unwrap();
                let got: Vec<_> = out.iter().filter(|d| d.class_name == name).cloned().collect();
                prop_assert_eq!(got, expected);
            }
        }
    }
}
