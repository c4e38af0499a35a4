//! Passive texture check against flat presentation attacks.
//!
//! A printed photo or a screen replay held up to the camera tends to have a
//! compressed dynamic range compared to a lit, three-dimensional face. The
//! checker measures the mean absolute deviation of grayscale intensity from
//! mid-gray (128) and flags frames whose deviation falls below a threshold.
//!
//! This is a weak heuristic. It only annotates the session and never blocks
//! detection or capture.

use crate::frame::Frame;
use crate::types::{FaceBox, FrameAnalysis};
use serde::{Deserialize, Serialize};

const MID_GRAY: f32 = 128.0;

/// Which pixels the texture metric is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpoofRegion {
    #[default]
    FullFrame,
    /// Detected face box, falling back to the full frame without a face.
    FaceBox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiSpoofConfig {
    pub enabled: bool,
    /// Mean deviation below which a frame is flagged.
    pub min_deviation: f32,
    pub region: SpoofRegion,
}

impl Default for AntiSpoofConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_deviation: 10.0,
            region: SpoofRegion::FullFrame,
        }
    }
}

/// Result of one texture check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpoofSignal {
    pub spoof_detected: bool,
    /// Mean |gray - 128| over the sampled region.
    pub mean_deviation: f32,
}

#[derive(Debug, Clone)]
pub struct AntiSpoofChecker {
    config: AntiSpoofConfig,
}

impl AntiSpoofChecker {
    pub fn new(config: AntiSpoofConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn check(&self, frame: &Frame, analysis: Option<&FrameAnalysis>) -> SpoofSignal {
        let face = match self.config.region {
            SpoofRegion::FullFrame => None,
            SpoofRegion::FaceBox => analysis.map(|a| &a.face_box),
        };
        let mean_deviation = mean_deviation_from_mid(frame, face);
        SpoofSignal {
            spoof_detected: mean_deviation < self.config.min_deviation,
            mean_deviation,
        }
    }
}

/// Mean absolute deviation of grayscale intensity from 128.
///
/// An empty region yields 0.0, which reads as "no texture".
pub fn mean_deviation_from_mid(frame: &Frame, region: Option<&FaceBox>) -> f32 {
    let (w, h) = (frame.width as usize, frame.height as usize);
    if frame.data.len() < w * h * 3 {
        return 0.0;
    }
    let (x0, y0, x1, y1) = match region {
        Some(b) => (
            clamp_coord(b.x, w),
            clamp_coord(b.y, h),
            clamp_coord(b.x + b.width, w),
            clamp_coord(b.y + b.height, h),
        ),
        None => (0, 0, w, h),
    };
    if x1 <= x0 || y1 <= y0 {
        return 0.0;
    }

    let mut total = 0.0f64;
    for y in y0..y1 {
        for x in x0..x1 {
            total += (frame.gray_at(x, y) - MID_GRAY).abs() as f64;
        }
    }
    (total / ((x1 - x0) * (y1 - y0)) as f64) as f32
}

fn clamp_coord(v: f32, max: usize) -> usize {
    if v.is_nan() {
        return 0;
    }
    (v.max(0.0) as usize).min(max)
}
