use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Intersection over union of two `[x1, y1, x2, y2]` boxes.
///
/// Always in `[0.0, 1.0]`. Malformed boxes (inverted or non-finite) count
/// as zero area, so the result is never negative or NaN.
#[must_use]
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);

    // Negated comparison so NaN coordinates also land here
    if !(ix2 > ix1 && iy2 > iy1) {
        return 0.0;
    }

    let intersection = (ix2 - ix1) * (iy2 - iy1);
    let union = area(a) + area(b) - intersection;

    if !(union > 0.0) || !intersection.is_finite() {
        return 0.0;
    }

    (intersection / union).clamp(0.0, 1.0)
}

/// Area of an `[x1, y1, x2, y2]` box, clamped to zero for malformed input.
#[must_use]
pub fn area(b: &[f32; 4]) -> f32 {
    let w = b[2] - b[0];
    let h = b[3] - b[1];
    if w > 0.0 && h > 0.0 {
        w * h
    } else {
        0.0
    }
}

/// Axis-aligned box in pixel coordinates with `x1 < x2` and `y1 < y2`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Result<Self, ConfigError> {
        if [x1, y1, x2, y2].iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::InvalidBox {
                x1,
                y1,
                x2,
                y2,
                reason: "contains NaN or infinite value",
            });
        }
        if x2 <= x1 || y2 <= y1 {
            return Err(ConfigError::InvalidBox {
                x1,
                y1,
                x2,
                y2,
                reason: "inverted or zero-area box",
            });
        }
        Ok(Self { x1, y1, x2, y2 })
    }

    pub fn x1(&self) -> f32 {
        self.x1
    }

    pub fn y1(&self) -> f32 {
        self.y1
    }

    pub fn x2(&self) -> f32 {
        self.x2
    }

    pub fn y2(&self) -> f32 {
        self.y2
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    #[must_use]
    pub fn as_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    /// Shifts the box by `(dx, dy)`.
    ///
    /// Fails only when the shifted coordinates stop being finite.
    pub fn translate(&self, dx: f32, dy: f32) -> Result<Self, ConfigError> {
        Self::new(self.x1 + dx, self.y1 + dy, self.x2 + dx, self.y2 + dy)
    }

    #[must_use]
    pub fn iou(&self, other: &Self) -> f32 {
        iou(&self.as_array(), &other.as_array())
    }
}

impl TryFrom<[f32; 4]> for BoundingBox {
    type Error = ConfigError;

    fn try_from(b: [f32; 4]) -> Result<Self, Self::Error> {
        BoundingBox::new(b[0], b[1], b[2], b[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        b.as_array()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = [10.0, 20.0, 110.0, 80.0];
        assert!((iou(&b, &b) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        assert_eq!(iou(&[0.0, 0.0, 10.0, 10.0], &[20.0, 20.0, 30.0, 30.0]), 0.0);
    }

    #[test]
    fn iou_of_touching_boxes_is_zero() {
        assert_eq!(iou(&[0.0, 0.0, 10.0, 10.0], &[10.0, 0.0, 20.0, 10.0]), 0.0);
    }

    #[test]
    fn iou_of_shifted_squares() {
        let v = iou(&[0.0, 0.0, 100.0, 100.0], &[10.0, 10.0, 110.0, 110.0]);
        // 8100 / 11900
        assert!((v - 0.680_672).abs() < 1e-4, "got {v}");
    }

    #[test]
    fn iou_of_degenerate_boxes_is_zero() {
        assert_eq!(iou(&[5.0, 5.0, 5.0, 5.0], &[5.0, 5.0, 5.0, 5.0]), 0.0);
        assert_eq!(iou(&[10.0, 10.0, 0.0, 0.0], &[0.0, 0.0, 10.0, 10.0]), 0.0);
    }

    #[test]
    fn iou_with_nan_is_zero() {
        assert_eq!(iou(&[f32::NAN, 0.0, 10.0, 10.0], &[0.0, 0.0, 10.0, 10.0]), 0.0);
    }

    #[test]
    fn area_clamps_inverted_boxes() {
        assert_eq!(area(&[10.0, 0.0, 0.0, 10.0]), 0.0);
        assert_eq!(area(&[0.0, 0.0, 4.0, 5.0]), 20.0);
    }

    #[test]
    fn bounding_box_rejects_inverted() {
        assert!(BoundingBox::new(5.0, 0.0, 1.0, 10.0).is_err());
        assert!(BoundingBox::new(0.0, 10.0, 5.0, 10.0).is_err());
    }

    #[test]
    fn bounding_box_rejects_non_finite() {
        assert!(BoundingBox::new(f32::NAN, 0.0, 1.0, 1.0).is_err());
        assert!(BoundingBox::new(0.0, 0.0, f32::INFINITY, 1.0).is_err());
    }

    #[test]
    fn bounding_box_translate() {
        let b = BoundingBox::new(1.0, 2.0, 3.0, 4.0).unwrap();
        let moved = b.translate(416.0, 208.0).unwrap();
        assert_eq!(moved.as_array(), [417.0, 210.0, 419.0, 212.0]);
        assert_eq!(b.as_array(), [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn bounding_box_serializes_as_array() {
        let b = BoundingBox::new(1.0, 2.0, 3.0, 4.0).unwrap();
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, "[1.0,2.0,3.0,4.0]");
        let back: BoundingBox = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
        assert!(serde_json::from_str::<BoundingBox>("[3.0,2.0,1.0,4.0]").is_err());
    }

    fn any_box() -> impl Strategy<Value = [f32; 4]> {
        (0.0f32..500.0, 0.0f32..500.0, 1.0f32..200.0, 1.0f32..200.0)
            .prop_map(|(x, y, w, h)| [x, y, x + w, y + h])
    }

    proptest! {
        #[test]
        fn iou_is_bounded(a in any_box(), b in any_box()) {
            let v = iou(&a, &b);
            prop_assert!((0.0..=1.0).contains(&v));
        }

        #[test]
        fn iou_is_symmetric(a in any_box(), b in any_box()) {
            prop_assert!((iou(&a, &b) - iou(&b, &a)).abs() < 1e-6);
        }

        #[test]
        fn iou_with_self_is_one(a in any_box()) {
            prop_assert!((iou(&a, &a) - 1.0).abs() < 1e-5);
        }

        #[test]
        fn iou_never_nan_for_arbitrary_input(
            a in prop::array::uniform4(-1000.0f32..1000.0),
            b in prop::array::uniform4(-1000.0f32..1000.0),
        ) {
            let v = iou(&a, &b);
            prop_assert!(v.is_finite());
            prop_assert!((0.0..=1.0).contains(&v));
        }
    }
}
