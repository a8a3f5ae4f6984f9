//! ONNX detector backend - YOLO export run locally through ONNX Runtime.
//!
//! Expects the usual single-output layout `[1, 4 + num_classes, candidates]`
//! where the first four rows are center-x, center-y, width and height in
//! input-pixel units and the remaining rows are per-class scores.

use async_trait::async_trait;
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{Array, Ix4};
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::config::{expand_path, DetectorConfig};
use crate::detector::{Detector, DetectorError};
use crate::models::Detection;

pub struct OnnxDetector {
    session: Arc<Mutex<Session>>,
    class_names: Arc<Vec<String>>,
    input_size: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl std::fmt::Debug for OnnxDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxDetector")
            .field("input_size", &self.input_size)
            .field("classes", &self.class_names.len())
            .finish_non_exhaustive()
    }
}

impl OnnxDetector {
    /// Load the model named in `config`.
    ///
    /// Returns `DetectorError::ModelNotFound` if the file is missing.
    pub fn new(config: &DetectorConfig) -> Result<Self, DetectorError> {
        let model_path = expand_path(&config.model_path);
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound {
                path: model_path.display().to_string(),
            });
        }

        let session = load_session(&model_path)?;
        tracing::info!(model = %model_path.display(), "Loaded ONNX detector");

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            class_names: Arc::new(config.class_names.clone()),
            input_size: config.input_size,
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
        })
    }
}

fn load_session(path: &Path) -> Result<Session, DetectorError> {
    Session::builder()
        .and_then(|mut b| b.commit_from_file(path))
        .map_err(|e| DetectorError::OnnxInference(e.to_string()))
}

#[async_trait]
impl Detector for OnnxDetector {
    async fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>, DetectorError> {
        // CPU-bound, runs on the blocking pool
        let session = Arc::clone(&self.session);
        let class_names = Arc::clone(&self.class_names);
        let image = image.clone();
        let input_size = self.input_size;
        let confidence_threshold = self.confidence_threshold;
        let iou_threshold = self.iou_threshold;

        tokio::task::spawn_blocking(move || {
            let mut session_guard = session
                .lock()
                .map_err(|e| DetectorError::OnnxInference(format!("session lock poisoned: {e}")))?;
            let (width, height) = image.dimensions();
            let input = preprocess(&image, input_size);
            let (shape, data) = run_sync(&mut session_guard, input, input_size)?;
            let candidates = decode_output(
                &shape,
                &data,
                Scale {
                    input_size,
                    width,
                    height,
                },
                confidence_threshold,
                &class_names,
            )?;
            Ok(non_max_suppression(candidates, iou_threshold))
        })
        .await
        .map_err(|e| DetectorError::OnnxInference(format!("spawn_blocking join error: {e}")))?
    }

    fn name(&self) -> &str {
        "onnx"
    }
}

/// Resize to the square model input and lay out as normalized NCHW.
pub fn preprocess(image: &DynamicImage, input_size: u32) -> Array<f32, Ix4> {
    let size = input_size as usize;
    let resized = image
        .resize_exact(input_size, input_size, FilterType::CatmullRom)
        .to_rgb8();

    let mut input = Array::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = r as f32 / 255.0;
        input[[0, 1, y, x]] = g as f32 / 255.0;
        input[[0, 2, y, x]] = b as f32 / 255.0;
    }
    input
}

fn run_sync(
    session: &mut Session,
    input: Array<f32, Ix4>,
    input_size: u32,
) -> Result<(Vec<i64>, Vec<f32>), DetectorError> {
    let side = input_size as i64;
    let shape = vec![1i64, 3, side, side];
    let (data, _offset) = input.into_raw_vec_and_offset();

    let tensor = Tensor::from_array((shape, data))
        .map_err(|e| DetectorError::OnnxInference(e.to_string()))?;

    let outputs = session
        .run(ort::inputs![tensor])
        .map_err(|e| DetectorError::OnnxInference(e.to_string()))?;

    let (out_shape, out_data) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| DetectorError::OnnxInference(e.to_string()))?;

    Ok((out_shape.to_vec(), out_data.to_vec()))
}

/// Maps model-input pixels back to the original image.
#[derive(Debug, Clone, Copy)]
pub struct Scale {
    pub input_size: u32,
    pub width: u32,
    pub height: u32,
}

/// Turn the raw `[1, 4 + nc, n]` output into detections above the threshold.
pub fn decode_output(
    shape: &[i64],
    data: &[f32],
    scale: Scale,
    confidence_threshold: f32,
    class_names: &[String],
) -> Result<Vec<Detection>, DetectorError> {
    if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 {
        return Err(DetectorError::InvalidOutput(format!(
            "expected [1, 4 + classes, candidates], got {:?}",
            shape
        )));
    }
    let rows = shape[1] as usize;
    let candidates = shape[2] as usize;
    if data.len() != rows * candidates {
        return Err(DetectorError::InvalidOutput(format!(
            "output holds {} values, shape needs {}",
            data.len(),
            rows * candidates
        )));
    }

    let sx = scale.width as f32 / scale.input_size as f32;
    let sy = scale.height as f32 / scale.input_size as f32;
    let at = |row: usize, col: usize| data[row * candidates + col];

    let mut detections = Vec::new();
    for col in 0..candidates {
        let (class_id, confidence) = (4..rows)
            .map(|row| (row - 4, at(row, col)))
            .fold((0usize, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

        if confidence < confidence_threshold {
            continue;
        }

        let xc = at(0, col) * sx;
        let yc = at(1, col) * sy;
        let w = at(2, col) * sx;
        let h = at(3, col) * sy;

        detections.push(Detection {
            x1: xc - w / 2.0,
            y1: yc - h / 2.0,
            x2: xc + w / 2.0,
            y2: yc + h / 2.0,
            confidence: confidence.clamp(0.0, 1.0),
            class_name: class_name(class_names, class_id),
        });
    }
    Ok(detections)
}

pub fn class_name(class_names: &[String], class_id: usize) -> String {
    class_names
        .get(class_id)
        .cloned()
        .unwrap_or_else(|| class_id.to_string())
}

/// Greedy per-class NMS. A box is only suppressed by a higher-confidence box
/// of the same class. Output is sorted by confidence.
pub fn non_max_suppression(mut boxes: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for candidate in boxes {
        if kept
            .iter()
            .filter(|k| k.class_name == candidate.class_name)
            .all(|k| k.iou(&candidate) < iou_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn names() -> Vec<String> {
        vec!["Bacteria".to_string(), "Fungi".to_string()]
    }

    #[test]
    fn test_model_not_found_returns_error() {
        let config = DetectorConfig {
            model_path: "/nonexistent/detector.onnx".to_string(),
            ..DetectorConfig::default()
        };
        match OnnxDetector::new(&config) {
            Err(DetectorError::ModelNotFound { path }) => {
                assert!(path.contains("nonexistent"), "path was: {path}");
            }
            other => panic!("Expected ModelNotFound, got: {other:?}"),
        }
    }

    #[test]
    fn test_preprocess_shape_and_range() {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(100, 50, Rgb([255, 0, 0]));
        let input = preprocess(&DynamicImage::ImageRgb8(img), 64);
        assert_eq!(input.shape(), &[1, 3, 64, 64]);
        assert!((input[[0, 0, 10, 10]] - 1.0).abs() < 1e-6);
        assert!(input[[0, 1, 10, 10]].abs() < 1e-6);
    }

    #[test]
    fn test_decode_output_scales_and_filters() {
        // 2 classes, 2 candidates, input 100 -> image 200x100
        let shape = [1i64, 6, 2];
        #[rustfmt::skip]
        let data = [
            50.0, 10.0,   // xc
            50.0, 10.0,   // yc
            20.0, 4.0,    // w
            10.0, 4.0,    // h
            0.1,  0.2,    // class 0
            0.8,  0.3,    // class 1
        ];
        let scale = Scale {
            input_size: 100,
            width: 200,
            height: 100,
        };
        let dets = decode_output(&shape, &data, scale, 0.5, &names()).unwrap();
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!(d.class_name, "Fungi");
        assert!((d.x1 - 80.0).abs() < 1e-4);
        assert!((d.x2 - 120.0).abs() < 1e-4);
        assert!((d.y1 - 45.0).abs() < 1e-4);
        assert!((d.y2 - 55.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_output_rejects_bad_shape() {
        let scale = Scale {
            input_size: 640,
            width: 640,
            height: 640,
        };
        assert!(decode_output(&[1, 4, 3], &[0.0; 12], scale, 0.5, &names()).is_err());
        assert!(decode_output(&[1, 6, 3], &[0.0; 5], scale, 0.5, &names()).is_err());
    }

    #[test]
    fn test_unknown_class_falls_back_to_id() {
        assert_eq!(class_name(&names(), 7), "7");
        assert_eq!(class_name(&names(), 0), "Bacteria");
    }

    #[test]
    fn test_nms_drops_overlapping_lower_confidence() {
        let a = Detection {
            x1: 0.0,
            y1: 0.0,
            x2: 10.0,
            y2: 10.0,
            confidence: 0.9,
            class_name: "Fungi".to_string(),
        };
        let b = Detection {
            x1: 1.0,
            y1: 1.0,
            x2: 10.0,
            y2: 10.0,
            confidence: 0.6,
            ..a.clone()
        };
        let c = Detection {
            x1: 50.0,
            y1: 50.0,
            x2: 60.0,
            y2: 60.0,
            confidence: 0.7,
            ..a.clone()
        };
        let kept = non_max_suppression(vec![b, c, a], 0.7);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_overlapping_boxes_of_different_classes() {
        let fungi = Detection {
            x1: 0.0,
            y1: 0.0,
            x2: 10.0,
            y2: 10.0,
            confidence: 0.9,
            class_name: "Fungi".to_string(),
        };
        let pest = Detection {
            x1: 1.0,
            y1: 1.0,
            x2: 10.0,
            y2: 10.0,
            confidence: 0.6,
            class_name: "Peste".to_string(),
        };
        let fungi_dup = Detection {
            confidence: 0.5,
            ..fungi.clone()
        };
        let kept = non_max_suppression(vec![fungi_dup, pest, fungi], 0.7);
        let classes: Vec<&str> = kept.iter().map(|d| d.class_name.as_str()).collect();
        assert_eq!(classes, vec!["Fungi", "Peste"]);
    }
}
