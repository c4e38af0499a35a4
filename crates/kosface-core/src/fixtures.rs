//! Synthetic landmark and frame builders for tests.
//!
//! Geometry is laid out so the requested eye aspect ratio, yaw and mouth
//! proportions come out exactly under the formulas in [`crate::liveness`]
//! with the default 100 px pose reference distance.

use crate::frame::Frame;
use crate::types::{Descriptor, FaceBox, FrameAnalysis, Landmarks68, Point, LANDMARK_COUNT};
use std::f32::consts::PI;

#[derive(Debug, Clone, Copy)]
pub struct FaceParams {
    pub ear: f32,
    pub yaw_deg: f32,
    pub mouth_width: f32,
    pub mouth_height: f32,
    pub detection_score: f32,
    pub with_descriptor: bool,
}

impl Default for FaceParams {
    fn default() -> Self {
        Self {
            ear: 0.32,
            yaw_deg: 0.0,
            mouth_width: 30.0,
            mouth_height: 12.0,
            detection_score: 0.9,
            with_descriptor: true,
        }
    }
}

const EYE_Y: f32 = 100.0;
const EYE_HALF_WIDTH: f32 = 10.0;
const MOUTH_Y: f32 = 150.0;

fn eye(center_x: f32, half_height: f32) -> [Point; 6] {
    let (l, r) = (center_x - EYE_HALF_WIDTH, center_x + EYE_HALF_WIDTH);
    let (a, b) = (center_x - EYE_HALF_WIDTH / 2.0, center_x + EYE_HALF_WIDTH / 2.0);
    [
        Point::new(l, EYE_Y),
        Point::new(a, EYE_Y - half_height),
        Point::new(b, EYE_Y - half_height),
        Point::new(r, EYE_Y),
        Point::new(b, EYE_Y + half_height),
        Point::new(a, EYE_Y + half_height),
    ]
}

/// Build 68 landmarks for a frontal face centred at x = 100.
pub fn landmarks(params: FaceParams) -> Landmarks68 {
    let mut points = vec![Point::default(); LANDMARK_COUNT];

    // Jaw arc.
    for (i, p) in points[0..17].iter_mut().enumerate() {
        let t = PI * i as f32 / 16.0;
        *p = Point::new(100.0 - 40.0 * t.cos(), 110.0 + 55.0 * t.sin());
    }
    // Brows.
    for (i, p) in points[17..27].iter_mut().enumerate() {
        *p = Point::new(65.0 + 7.5 * i as f32, 85.0);
    }
    // Nose bridge and nostrils; tip is placed below.
    for (i, p) in points[27..31].iter_mut().enumerate() {
        *p = Point::new(100.0, 105.0 + 6.0 * i as f32);
    }
    for (i, p) in points[31..36].iter_mut().enumerate() {
        *p = Point::new(92.0 + 4.0 * i as f32, 135.0);
    }

    // EAR = 4h / (2 * 2 * EYE_HALF_WIDTH) = h / EYE_HALF_WIDTH
    let half_height = params.ear * EYE_HALF_WIDTH;
    points[36..42].copy_from_slice(&eye(80.0, half_height));
    points[42..48].copy_from_slice(&eye(120.0, half_height));

    // Eye midpoint is (100, EYE_Y); offset the tip so atan2(dx, 100) = yaw.
    let dx = 100.0 * params.yaw_deg.to_radians().tan();
    points[30] = Point::new(100.0 + dx, 130.0);

    let (hw, hh) = (params.mouth_width / 2.0, params.mouth_height / 2.0);
    for k in 0..12 {
        let theta = PI - k as f32 * PI / 6.0;
        points[48 + k] = Point::new(100.0 + hw * theta.cos(), MOUTH_Y - hh * theta.sin());
    }
    for j in 0..8 {
        let theta = PI - j as f32 * PI / 4.0;
        points[60 + j] = Point::new(100.0 + hw * 0.6 * theta.cos(), MOUTH_Y - hh * 0.5 * theta.sin());
    }

    match Landmarks68::new(points) {
        Ok(lm) => lm,
        Err(e) => unreachable!("fixture builds exactly 68 points: {e}"),
    }
}

/// Full analysis for the synthetic face.
pub fn analysis(params: FaceParams) -> FrameAnalysis {
    FrameAnalysis {
        face_box: FaceBox { x: 60.0, y: 70.0, width: 80.0, height: 110.0 },
        landmarks: landmarks(params),
        descriptor: params.with_descriptor.then(|| Descriptor {
            values: vec![0.5, 0.5, 0.5, 0.5],
            model_version: Some("fixture".into()),
        }),
        detection_score: params.detection_score,
    }
}

/// Uniform gray frame (zero texture).
pub fn flat_frame(width: u32, height: u32, level: u8) -> Frame {
    let data = vec![level; width as usize * height as usize * 3];
    match Frame::from_rgb(data, width, height, 0) {
        Ok(f) => f,
        Err(e) => unreachable!("buffer sized from dimensions: {e}"),
    }
}

/// Frame with deterministic high-frequency noise spanning the full range.
pub fn noisy_frame(width: u32, height: u32, seed: u32) -> Frame {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    let data = (0..width as usize * height as usize)
        .flat_map(|_| {
            // xorshift32
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let v = (state >> 24) as u8;
            [v, v, v]
        })
        .collect();
    match Frame::from_rgb(data, width, height, seed) {
        Ok(f) => f,
        Err(e) => unreachable!("buffer sized from dimensions: {e}"),
    }
}
