//! 68-point facial landmark regression via ONNX Runtime.
//!
//! Runs the InsightFace `1k3d68` model on a square crop around a detected
//! face. The model regresses normalised coordinates in [-1, 1] relative to
//! the crop; only x/y are kept from the 3-D output.

use crate::alignment::sample_rgb;
use crate::frame::Frame;
use crate::types::{FaceBox, LandmarkCountError, Landmarks68, Point, LANDMARK_COUNT};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const LANDMARK_INPUT_SIZE: usize = 192;
/// Crop side relative to the longer face-box edge.
const LANDMARK_CROP_SCALE: f32 = 1.5;
// The model carries its own input normalisation (leading batch-norm).
const LANDMARK_MEAN: f32 = 0.0;
const LANDMARK_STD: f32 = 1.0;

#[derive(Error, Debug)]
pub enum LandmarkerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("unexpected landmark output length {0}")]
    UnexpectedOutput(usize),
    #[error(transparent)]
    Count(#[from] LandmarkCountError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Square crop in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Crop {
    x: f32,
    y: f32,
    side: f32,
}

impl Crop {
    fn around(face: &FaceBox) -> Self {
        let c = face.center();
        let side = face.width.max(face.height) * LANDMARK_CROP_SCALE;
        Self { x: c.x - side / 2.0, y: c.y - side / 2.0, side }
    }

    fn pixel(&self) -> f32 {
        self.side / LANDMARK_INPUT_SIZE as f32
    }
}

pub struct Landmarker {
    session: Session,
}

impl Landmarker {
    pub fn load(model_path: &Path) -> Result<Self, LandmarkerError> {
        if !model_path.exists() {
            return Err(LandmarkerError::ModelNotFound(model_path.display().to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        tracing::info!(path = %model_path.display(), "loaded landmark model");
        Ok(Self { session })
    }

    /// Regress 68 landmarks for the face inside `face_box`.
    pub fn landmarks(&mut self, frame: &Frame, face_box: &FaceBox) -> Result<Landmarks68, LandmarkerError> {
        let crop = Crop::around(face_box);
        let input = preprocess(frame, &crop);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LandmarkerError::InferenceFailed(format!("landmark output: {e}")))?;
        decode(raw, &crop)
    }
}

fn preprocess(frame: &Frame, crop: &Crop) -> Array4<f32> {
    let size = LANDMARK_INPUT_SIZE;
    let px = crop.pixel();
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let sx = crop.x + (x as f32 + 0.5) * px - 0.5;
            let sy = crop.y + (y as f32 + 0.5) * px - 0.5;
            let rgb = sample_rgb(frame, sx, sy);
            for c in 0..3 {
                tensor[[0, c, y, x]] = (rgb[c] - LANDMARK_MEAN) / LANDMARK_STD;
            }
        }
    }
    tensor
}

/// Map raw model output to frame coordinates.
///
/// Accepts a 2-D (68 × 2) or 3-D (N × 3, last 68 rows) layout.
fn decode(raw: &[f32], crop: &Crop) -> Result<Landmarks68, LandmarkerError> {
    let (dim, skip) = if raw.len() == LANDMARK_COUNT * 2 {
        (2, 0)
    } else if raw.len() % 3 == 0 && raw.len() >= LANDMARK_COUNT * 3 {
        (3, raw.len() / 3 - LANDMARK_COUNT)
    } else {
        return Err(LandmarkerError::UnexpectedOutput(raw.len()));
    };

    let half = LANDMARK_INPUT_SIZE as f32 / 2.0;
    let px = crop.pixel();
    let points = raw
        .chunks_exact(dim)
        .skip(skip)
        .map(|p| {
            let ix = (p[0] + 1.0) * half;
            let iy = (p[1] + 1.0) * half;
            Point::new(crop.x + ix * px, crop.y + iy * px)
        })
        .collect();
    Ok(Landmarks68::new(points)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_is_square_and_centered() {
        let crop = Crop::around(&FaceBox { x: 100.0, y: 50.0, width: 80.0, height: 120.0 });
        assert_eq!(crop.side, 180.0);
        assert_eq!((crop.x + crop.side / 2.0, crop.y + crop.side / 2.0), (140.0, 110.0));
    }

    #[test]
    fn test_decode_3d_uses_trailing_rows() {
        let crop = Crop { x: 10.0, y: 20.0, side: 192.0 };
        // 1103 rows × 3 like 1k3d68; leading rows are garbage.
        let mut raw = vec![9.0f32; 1103 * 3];
        for row in raw.chunks_exact_mut(3).skip(1103 - LANDMARK_COUNT) {
            row.copy_from_slice(&[0.0, -1.0, 0.3]);
        }
        let lm = decode(&raw, &crop).unwrap();
        // (0, -1) → input (96, 0) → frame (106, 20)
        assert_eq!(lm.points()[0], Point::new(106.0, 20.0));
        assert_eq!(lm.points()[67], Point::new(106.0, 20.0));
    }

    #[test]
    fn test_decode_2d_layout() {
        let crop = Crop { x: 0.0, y: 0.0, side: 96.0 };
        let raw = vec![1.0f32; LANDMARK_COUNT * 2];
        let lm = decode(&raw, &crop).unwrap();
        // (1, 1) → input (192, 192) → scaled by 0.5 → (96, 96)
        assert_eq!(lm.points()[10], Point::new(96.0, 96.0));
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        let crop = Crop { x: 0.0, y: 0.0, side: 192.0 };
        assert!(matches!(
            decode(&[0.0; 100], &crop),
            Err(LandmarkerError::UnexpectedOutput(100))
        ));
    }
}
