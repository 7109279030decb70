//! YOLO-style ONNX detector behind the [`Detector`] trait.

use std::path::Path;
use std::sync::Mutex;

use image::{Rgb, RgbImage};
use ndarray::{Array2, Array4, ArrayView1};
use ort::session::Session;
use tracing::{debug, instrument, warn};

use crate::detection::{Detection, DetectionSet, RawDetection};
use crate::detector::{Detector, DetectorError};
use crate::geometry::BoundingBox;
use crate::image_processing::{letterbox, LetterboxTransform};
use crate::partition::RegionSize;
use crate::suppress::{per_class_nms, validate_iou_threshold};
use crate::ConfigError;

/// Upper bound on anchors accepted from the model output.
const MAX_MODEL_DETECTIONS: usize = 50_000;

/// Candidates entering NMS are capped to bound CPU time.
const MAX_NMS_INPUTS: usize = 300;

const LETTERBOX_FILL: Rgb<u8> = Rgb([114, 114, 114]);

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

impl From<ort::Error> for DetectorError {
    fn from(e: ort::Error) -> Self {
        tracing::error!(error = %e, "onnx runtime error");
        Self::Inference("internal inference error".into())
    }
}

#[derive(Debug, Clone)]
struct ModelConfig {
    input_height: u32,
    input_width: u32,
    num_classes: usize,
    output_features: usize,
}

/// Detector backed by an ONNX Runtime session.
///
/// Inference is serialized by a mutex; the engine's worker pool still
/// overlaps preprocessing and postprocessing across regions.
pub struct OnnxDetector {
    session: Mutex<Session>,
    model: ModelConfig,
    postprocessor: Postprocessor,
}

/// Turns raw anchor rows into region-pixel detections.
#[derive(Debug, Clone)]
struct Postprocessor {
    class_names: Vec<String>,
    iou_threshold: f32,
}

impl OnnxDetector {
    /// Loads a model from memory. `class_names[i]` names class id `i`;
    /// ids without a name are reported as `Unknown_{id}`.
    #[instrument(skip(model_bytes, class_names), fields(model_size = model_bytes.len()))]
    pub fn from_bytes(model_bytes: &[u8], class_names: Vec<String>) -> Result<Self, DetectorError> {
        let session = Session::builder()?.commit_from_memory(model_bytes)?;
        let model = Self::extract_model_config(&session)?;

        if class_names.len() > model.num_classes {
            warn!(
                names = class_names.len(),
                classes = model.num_classes,
                "more class names than model classes"
            );
        }

        debug!(
            input_width = model.input_width,
            input_height = model.input_height,
            num_classes = model.num_classes,
            "model loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            model,
            postprocessor: Postprocessor::new(class_names, DEFAULT_IOU_THRESHOLD)
                .map_err(|e| DetectorError::ModelMismatch(e.to_string()))?,
        })
    }

    pub fn from_file(path: impl AsRef<Path>, class_names: Vec<String>) -> Result<Self, DetectorError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| DetectorError::ModelMismatch(format!("{}: {e}", path.display())))?;
        Self::from_bytes(&bytes, class_names)
    }

    /// Replaces the suppression threshold applied to each region's output.
    pub fn with_iou_threshold(mut self, iou_threshold: f32) -> Result<Self, ConfigError> {
        self.postprocessor.iou_threshold = validate_iou_threshold(iou_threshold)?;
        Ok(self)
    }

    pub fn input_size(&self) -> RegionSize {
        RegionSize::new(self.model.input_width, self.model.input_height)
    }

    fn extract_model_config(session: &Session) -> Result<ModelConfig, DetectorError> {
        let input = session
            .inputs
            .first()
            .ok_or_else(|| DetectorError::ModelMismatch("model has no inputs".into()))?;

        let input_dims: Vec<i64> = input
            .input_type
            .tensor_dimensions()
            .ok_or_else(|| DetectorError::ModelMismatch("input is not a tensor".into()))?
            .collect();

        // [batch, channels, height, width]
        if input_dims.len() != 4 {
            return Err(DetectorError::ModelMismatch(format!(
                "expected 4D input, got {}D",
                input_dims.len()
            )));
        }

        let (input_height, input_width) = (input_dims[2], input_dims[3]);
        if !(1..=4096).contains(&input_height) || !(1..=4096).contains(&input_width) {
            return Err(DetectorError::ModelMismatch(format!(
                "invalid input dimensions: {input_width}x{input_height}"
            )));
        }

        let output = session
            .outputs
            .first()
            .ok_or_else(|| DetectorError::ModelMismatch("model has no outputs".into()))?;

        let output_dims: Vec<i64> = output
            .output_type
            .tensor_dimensions()
            .ok_or_else(|| DetectorError::ModelMismatch("output is not a tensor".into()))?
            .collect();

        // [1, 4 + classes, anchors] or [1, anchors, 4 + classes]
        if output_dims.len() != 3 {
            return Err(DetectorError::ModelMismatch(format!(
                "expected 3D output, got {}D",
                output_dims.len()
            )));
        }

        let output_features = output_dims[1].min(output_dims[2]);
        if output_features < 5 {
            return Err(DetectorError::ModelMismatch(format!(
                "output features too small: {output_features}"
            )));
        }
        let output_features = output_features as usize;

        Ok(ModelConfig {
            input_height: input_height as u32,
            input_width: input_width as u32,
            num_classes: output_features - 4,
            output_features,
        })
    }

    /// Letterboxes the region to the model input and lays it out as a
    /// normalized NCHW tensor.
    fn preprocess(&self, region: &RgbImage) -> Result<(Array4<f32>, LetterboxTransform), DetectorError> {
        let (framed, transform) = letterbox(region, self.model.input_width, self.model.input_height, LETTERBOX_FILL)
            .map_err(|e| DetectorError::Preprocess(e.to_string()))?;

        let (w, h) = (self.model.input_width as usize, self.model.input_height as usize);
        let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
        for (x, y, pixel) in framed.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                tensor[[0, c, y, x]] = f32::from(pixel.0[c]) / 255.0;
            }
        }

        Ok((tensor, transform))
    }

    /// Runs the session and normalizes its output to `[anchors, features]`.
    fn run_inference(&self, input: Array4<f32>) -> Result<Array2<f32>, DetectorError> {
        let input_value = ort::value::Value::from_array(input)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::Inference("session lock poisoned".into()))?;

        let outputs = session.run(ort::inputs![input_value])?;

        let output_tensor = outputs
            .get("output0")
            .or_else(|| outputs.get("output"))
            .ok_or_else(|| DetectorError::InvalidOutput {
                expected: "output0".into(),
                got: "no output node".into(),
            })?;

        let (shape, data) = output_tensor.try_extract_tensor::<f32>()?;

        if shape.len() != 3 || shape.iter().any(|&d| d < 0) {
            return Err(DetectorError::InvalidOutput {
                expected: "[batch, features, anchors] or [batch, anchors, features]".into(),
                got: format!("{shape:?}"),
            });
        }

        let features = self.model.output_features;
        let (dim1, dim2) = (shape[1] as usize, shape[2] as usize);
        let anchors = if dim1 == features { dim2 } else { dim1 };
        if anchors > MAX_MODEL_DETECTIONS {
            return Err(DetectorError::InvalidOutput {
                expected: format!("at most {MAX_MODEL_DETECTIONS} anchors"),
                got: format!("{anchors} anchors"),
            });
        }

        if dim1 == features {
            let arr = Array2::from_shape_vec((features, anchors), data.to_vec())
                .map_err(|e| DetectorError::Inference(e.to_string()))?;
            Ok(arr.t().to_owned())
        } else if dim2 == features {
            Array2::from_shape_vec((anchors, features), data.to_vec())
                .map_err(|e| DetectorError::Inference(e.to_string()))
        } else {
            Err(DetectorError::InvalidOutput {
                expected: format!("feature dim = {features}"),
                got: format!("{shape:?}"),
            })
        }
    }
}

impl Postprocessor {
    fn new(class_names: Vec<String>, iou_threshold: f32) -> Result<Self, ConfigError> {
        Ok(Self {
            class_names,
            iou_threshold: validate_iou_threshold(iou_threshold)?,
        })
    }

    fn class_name(&self, class_id: usize) -> String {
        self.class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("Unknown_{class_id}"))
    }

    /// Decodes anchor rows into region-pixel detections, then suppresses
    /// duplicates per class.
    fn decode(
        &self,
        output: &Array2<f32>,
        transform: LetterboxTransform,
        confidence_threshold: f32,
    ) -> Result<Vec<RawDetection>, DetectorError> {
        let mut candidates = Vec::new();

        for row in output.rows() {
            let Some((class_id, score)) = best_class(&row) else {
                continue;
            };
            if !score.is_finite() || score < confidence_threshold {
                continue;
            }

            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            if !(cx.is_finite() && cy.is_finite() && w > 0.0 && h > 0.0) {
                continue;
            }

            let [x1, y1, x2, y2] =
                transform.to_source([cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]);
            let Ok(bbox) = BoundingBox::new(x1, y1, x2, y2) else {
                continue;
            };

            candidates.push(Detection {
                bbox,
                confidence: score,
                class_id: class_id as u32,
                class_name: self.class_name(class_id),
            });
        }

        if candidates.len() > MAX_NMS_INPUTS {
            warn!(candidates = candidates.len(), limit = MAX_NMS_INPUTS, "nms input truncated");
            candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
            candidates.truncate(MAX_NMS_INPUTS);
        }

        let kept = per_class_nms(&DetectionSet::from(candidates), self.iou_threshold)
            .map_err(|e| DetectorError::ModelMismatch(e.to_string()))?;

        Ok(kept
            .into_iter()
            .map(|d| RawDetection::new(d.bbox.as_array(), d.confidence, d.class_id, d.class_name))
            .collect())
    }
}

/// Highest-scoring class in an anchor row, skipping the four box columns.
fn best_class(row: &ArrayView1<'_, f32>) -> Option<(usize, f32)> {
    row.iter()
        .skip(4)
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

impl Detector for OnnxDetector {
    fn detect(
        &self,
        region: &RgbImage,
        confidence_threshold: f32,
        _target_size: RegionSize,
    ) -> Result<Vec<RawDetection>, DetectorError> {
        let (input, transform) = self.preprocess(region)?;
        let output = self.run_inference(input)?;
        let detections = self.postprocessor.decode(&output, transform, confidence_threshold)?;
        debug!(detections = detections.len(), "region inference complete");
        Ok(detections)
    }

    fn name(&self) -> &str {
        "onnx"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn best_class_skips_box_columns() {
        let row = array![100.0f32, 100.0, 50.0, 50.0, 0.1, 0.7, 0.3];
        assert_eq!(best_class(&row.view()), Some((1, 0.7)));

        let boxes_only = array![1.0f32, 2.0, 3.0, 4.0];
        assert_eq!(best_class(&boxes_only.view()), None);
    }

    #[test]
    fn iou_threshold_is_validated() {
        for bad in [-0.1, 1.5, f32::NAN] {
            assert!(matches!(
                Postprocessor::new(Vec::new(), bad),
                Err(ConfigError::InvalidIouThreshold(_))
            ));
        }
        assert!(Postprocessor::new(Vec::new(), 0.0).is_ok());
        assert!(Postprocessor::new(Vec::new(), 1.0).is_ok());
    }

    #[test]
    fn decode_filters_names_and_suppresses_rows() {
        let post = Postprocessor::new(vec!["car".into()], DEFAULT_IOU_THRESHOLD).unwrap();
        let identity = LetterboxTransform {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
            source_width: 100,
            source_height: 100,
        };
        let output = array![
            [30.0f32, 30.0, 20.0, 20.0, 0.9, 0.1],
            // near-duplicate of the first row
            [31.0, 30.0, 20.0, 20.0, 0.8, 0.0],
            [70.0, 70.0, 10.0, 10.0, 0.1, 0.6],
            // below the confidence threshold
            [50.0, 50.0, 10.0, 10.0, 0.1, 0.2],
            // degenerate box
            [10.0, 10.0, 0.0, 10.0, 0.9, 0.0],
        ];

        let detections = post.decode(&output, identity, 0.25).unwrap();
        assert_eq!(detections.len(), 2);

        let car = detections.iter().find(|d| d.class_id == 0).unwrap();
        assert_eq!(car.class_name, "car");
        assert_eq!(car.bbox, [20.0, 20.0, 40.0, 40.0]);
        assert!((car.confidence - 0.9).abs() < 1e-6);

        let unnamed = detections.iter().find(|d| d.class_id == 1).unwrap();
        assert_eq!(unnamed.class_name, "Unknown_1");
        assert_eq!(unnamed.bbox, [65.0, 65.0, 75.0, 75.0]);
    }
}
