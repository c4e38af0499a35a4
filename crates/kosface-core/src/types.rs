use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Number of points in the iBUG 68-point landmark layout.
pub const LANDMARK_COUNT: usize = 68;

// iBUG 68 regions. "Left"/"right" are image-side, as seen in the unmirrored frame.
const JAW: Range<usize> = 0..17;
const NOSE: Range<usize> = 27..36;
const LEFT_EYE: Range<usize> = 36..42;
const RIGHT_EYE: Range<usize> = 42..48;
const MOUTH: Range<usize> = 48..68;
const NOSE_TIP: usize = 30;

/// A 2-D point in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub fn midpoint(&self, other: &Point) -> Point {
        Point::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }
}

/// Axis-aligned face bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceBox {
    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// 68 facial landmarks with named region accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Point>", into = "Vec<Point>")]
pub struct Landmarks68 {
    points: Vec<Point>,
}

impl Landmarks68 {
    pub fn new(points: Vec<Point>) -> Result<Self, LandmarkCountError> {
        if points.len() != LANDMARK_COUNT {
            return Err(LandmarkCountError(points.len()));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn jaw(&self) -> &[Point] {
        &self.points[JAW]
    }

    pub fn nose(&self) -> &[Point] {
        &self.points[NOSE]
    }

    pub fn nose_tip(&self) -> Point {
        self.points[NOSE_TIP]
    }

    /// Six eye contour points, outer corner first (p1..p6 in EAR notation).
    pub fn left_eye(&self) -> &[Point] {
        &self.points[LEFT_EYE]
    }

    /// Six eye contour points, inner corner first (p1..p6 in EAR notation).
    pub fn right_eye(&self) -> &[Point] {
        &self.points[RIGHT_EYE]
    }

    pub fn mouth(&self) -> &[Point] {
        &self.points[MOUTH]
    }

    /// Centroid of an eye region.
    pub fn eye_center(eye: &[Point]) -> Point {
        let n = eye.len().max(1) as f32;
        let (sx, sy) = eye.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
        Point::new(sx / n, sy / n)
    }

    /// Five alignment points: [left_eye, right_eye, nose_tip, left_mouth, right_mouth].
    pub fn five_point(&self) -> [(f32, f32); 5] {
        let le = Self::eye_center(self.left_eye());
        let re = Self::eye_center(self.right_eye());
        let nose = self.nose_tip();
        let lm = self.points[48];
        let rm = self.points[54];
        [(le.x, le.y), (re.x, re.y), (nose.x, nose.y), (lm.x, lm.y), (rm.x, rm.y)]
    }
}

impl TryFrom<Vec<Point>> for Landmarks68 {
    type Error = LandmarkCountError;

    fn try_from(points: Vec<Point>) -> Result<Self, Self::Error> {
        Self::new(points)
    }
}

impl From<Landmarks68> for Vec<Point> {
    fn from(landmarks: Landmarks68) -> Self {
        landmarks.points
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("expected {LANDMARK_COUNT} landmarks, got {0}")]
pub struct LandmarkCountError(pub usize);

/// Face descriptor vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
    /// Model that produced this descriptor (e.g. "w600k_r50").
    pub model_version: Option<String>,
}

impl Descriptor {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Processes every dimension regardless of intermediate values.
    pub fn similarity(&self, other: &Descriptor) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Head rotation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HeadPose {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

/// Per-tick analysis of one face in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameAnalysis {
    pub face_box: FaceBox,
    pub landmarks: Landmarks68,
    /// `None` when the recognition model is not loaded.
    pub descriptor: Option<Descriptor>,
    /// Detector confidence in [0, 1].
    pub detection_score: f32,
}
