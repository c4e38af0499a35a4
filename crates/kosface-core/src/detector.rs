//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three stride levels followed by non-maximum
//! suppression. Input frames are letterboxed into a 640×640 RGB tensor.

use crate::alignment::sample_rgb;
use crate::frame::Frame;
use crate::types::FaceBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// One detected face before landmarking.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub face_box: FaceBox,
    pub score: f32,
    /// [left_eye, right_eye, nose, left_mouth, right_mouth]
    pub keypoints: Option<[(f32, f32); 5]>,
}

/// Scale and padding applied when fitting a frame into the square input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, size: usize) -> Self {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((size as f32 - new_w) / 2.0).floor(),
            pad_y: ((size as f32 - new_h) / 2.0).floor(),
        }
    }

    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }

    #[cfg(test)]
    fn to_input(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.scale + self.pad_x, y * self.scale + self.pad_y)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

pub struct FaceDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs 9 outputs (score/bbox/kps per stride), got {}",
                names.len()
            )));
        }
        let stride_outputs = map_outputs(&names);
        tracing::info!(path = %model_path.display(), ?stride_outputs, "loaded SCRFD model");

        Ok(Self { session, stride_outputs })
    }

    /// Detect faces above `threshold`, strongest first.
    pub fn detect(&mut self, frame: &Frame, threshold: f32) -> Result<Vec<Detection>, DetectorError> {
        let letterbox = Letterbox::fit(frame.width, frame.height, SCRFD_INPUT_SIZE);
        let input = preprocess(frame, &letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (si, bi, ki) = self.stride_outputs[level];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(si, "scores")?;
            let boxes = extract(bi, "boxes")?;
            let kps = extract(ki, "keypoints")?;
            candidates.extend(decode_level(scores, boxes, kps, stride, &letterbox, threshold));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Resolve output ordering from tensor names (`score_8`, `bbox_16`, `kps_32`, ...),
/// falling back to the positional export order [scores, boxes, kps] × [8, 16, 32].
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let mut mapped = [(0, 0, 0); 3];
    for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => mapped[level] = (s, b, k),
            _ => {
                tracing::debug!(?names, "SCRFD output names not recognised, using positional mapping");
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }
    mapped
}

fn preprocess(frame: &Frame, letterbox: &Letterbox) -> Array4<f32> {
    let size = SCRFD_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let new_w = (frame.width as f32 * letterbox.scale).round();
    let new_h = (frame.height as f32 * letterbox.scale).round();
    let inv = 1.0 / letterbox.scale;

    for y in 0..size {
        for x in 0..size {
            let (lx, ly) = (x as f32 - letterbox.pad_x, y as f32 - letterbox.pad_y);
            // Padding stays at zero, which is SCRFD_MEAN after normalisation.
            if lx < 0.0 || ly < 0.0 || lx >= new_w || ly >= new_h {
                continue;
            }
            let rgb = sample_rgb(frame, (lx + 0.5) * inv - 0.5, (ly + 0.5) * inv - 0.5);
            for c in 0..3 {
                tensor[[0, c, y, x]] = (rgb[c] - SCRFD_MEAN) / SCRFD_STD;
            }
        }
    }
    tensor
}

fn decode_level(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<Detection> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let s = stride as f32;

    (0..grid_w * grid_h * SCRFD_ANCHORS_PER_CELL)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score < threshold {
                return None;
            }
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid_w) as f32 * s;
            let ay = (cell / grid_w) as f32 * s;

            let b = boxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.to_frame(ax - b[0] * s, ay - b[1] * s);
            let (x2, y2) = letterbox.to_frame(ax + b[2] * s, ay + b[3] * s);

            let keypoints = kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| letterbox.to_frame(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
            });

            Some(Detection {
                face_box: FaceBox { x: x1, y: y1, width: x2 - x1, height: y2 - y1 },
                score,
                keypoints,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output sorted by descending score.
fn nms(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let mut keep: Vec<Detection> = Vec::new();
    for c in candidates {
        if keep.iter().all(|k| iou(&k.face_box, &c.face_box) <= iou_threshold) {
            keep.push(c);
        }
    }
    keep
}

fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let ix = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let iy = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = ix * iy;
    let union = a.area() + b.area() - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, w: f32, h: f32, score: f32) -> Detection {
        Detection {
            face_box: FaceBox { x, y, width: w, height: h },
            score,
            keypoints: None,
        }
    }

    #[test]
    fn test_iou_cases() {
        let a = FaceBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0 };
        let b = FaceBox { x: 5.0, y: 0.0, width: 10.0, height: 10.0 };
        let far = FaceBox { x: 50.0, y: 50.0, width: 10.0, height: 10.0 };
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(iou(&a, &far), 0.0);
    }

    #[test]
    fn test_nms_keeps_strongest_of_overlap() {
        let kept = nms(
            vec![
                det(5.0, 5.0, 100.0, 100.0, 0.8),
                det(200.0, 200.0, 50.0, 50.0, 0.7),
                det(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            0.4,
        );
        let scores: Vec<f32> = kept.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
    }

    #[test]
    fn test_letterbox_roundtrip_640x480() {
        let lb = Letterbox::fit(640, 480, SCRFD_INPUT_SIZE);
        assert_eq!(lb.scale, 1.0);
        assert_eq!(lb.pad_y, 80.0);
        let (ix, iy) = lb.to_input(123.0, 45.0);
        let (fx, fy) = lb.to_frame(ix, iy);
        assert!((fx - 123.0).abs() < 1e-4 && (fy - 45.0).abs() < 1e-4);
    }

    #[test]
    fn test_map_outputs_named_and_positional() {
        let named: Vec<String> = ["bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(map_outputs(&named), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);

        let numeric: Vec<String> = (0..9).map(|i| format!("{}", 440 + i)).collect();
        assert_eq!(map_outputs(&numeric), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_decode_level_threshold_and_geometry() {
        // Stride 32 on a 640 input: 20×20 cells, 2 anchors each.
        let cells = 20 * 20 * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; cells];
        let mut boxes = vec![0.0f32; cells * 4];
        let kps = vec![0.0f32; cells * 10];

        // Anchor index 42 → cell 21 → (x=1, y=1) → anchor centre (32, 32).
        scores[42] = 0.8;
        boxes[42 * 4..42 * 4 + 4].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);
        scores[43] = 0.3;

        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let dets = decode_level(&scores, &boxes, &kps, 32, &lb, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!(d.face_box, FaceBox { x: 16.0, y: 16.0, width: 32.0, height: 32.0 });
        assert_eq!(d.keypoints.unwrap()[0], (32.0, 32.0));
    }
}
