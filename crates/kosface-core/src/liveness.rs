//! Active liveness detection over a stream of per-frame landmark analyses.
//!
//! The engine walks the subject through an ordered challenge sequence:
//! blink twice, turn left, turn right, smile. Each tick folds one
//! [`FrameAnalysis`] into a [`LivenessState`] via [`LivenessEngine::update`],
//! which is a pure function of the previous state, the analysis and the
//! wall-clock instant. There is no I/O here.
//!
//! # Signals
//!
//! - **Eye aspect ratio (EAR):** `(|p2-p6| + |p3-p5|) / (2|p1-p4|)` per eye,
//!   averaged over both eyes. A drop from at-or-above the threshold to below
//!   it counts as one blink, subject to a debounce interval.
//! - **Head pose:** yaw and pitch from the nose-tip offset against the
//!   inter-eye midpoint, converted with `atan2` against a fixed reference
//!   distance; roll from the outer eye-corner vector.
//! - **Smile:** by default only checks that mouth landmarks are present and
//!   finite. This is a placeholder, not expression recognition. The
//!   [`SmileHeuristic::MouthAspect`] variant uses a width/height ratio instead.
//!
//! # Invariants
//!
//! `completed_steps` only grows within a session and is always a prefix of
//! the configured sequence. `current_step` is the first step not yet
//! completed, or [`LivenessStep::Complete`].

use crate::types::{FrameAnalysis, HeadPose, Landmarks68, Point};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// One challenge in the liveness sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessStep {
    Blink,
    TurnLeft,
    TurnRight,
    Smile,
    Complete,
}

/// Canonical challenge order. Configured sequences must be a subsequence of it.
pub const CANONICAL_STEPS: [LivenessStep; 4] = [
    LivenessStep::Blink,
    LivenessStep::TurnLeft,
    LivenessStep::TurnRight,
    LivenessStep::Smile,
];

/// How the smile step is judged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SmileHeuristic {
    /// Passes whenever mouth landmarks exist and are finite.
    LandmarkPresence,
    /// Passes when outer-lip width / height reaches `min_ratio`.
    MouthAspect { min_ratio: f32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Required challenge sequence. Empty disables active liveness.
    pub steps: Vec<LivenessStep>,
    pub ear_threshold: f32,
    pub blink_debounce_ms: u64,
    pub blinks_required: u32,
    pub yaw_threshold_deg: f32,
    /// Reference distance (pixels) for the nose-offset `atan2`.
    pub pose_reference_distance: f32,
    pub smile: SmileHeuristic,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            steps: CANONICAL_STEPS.to_vec(),
            ear_threshold: 0.25,
            blink_debounce_ms: 500,
            blinks_required: 2,
            yaw_threshold_deg: 15.0,
            pose_reference_distance: 100.0,
            smile: SmileHeuristic::LandmarkPresence,
        }
    }
}

impl LivenessConfig {
    pub fn validate(&self) -> Result<(), LivenessConfigError> {
        let mut canonical = CANONICAL_STEPS.iter();
        for step in &self.steps {
            if *step == LivenessStep::Complete {
                return Err(LivenessConfigError::CompleteInSequence);
            }
            // Subsequence check: each step must appear later in the canonical order.
            if !canonical.any(|c| c == step) {
                return Err(LivenessConfigError::OutOfOrder(*step));
            }
        }
        if !(self.ear_threshold > 0.0 && self.ear_threshold < 1.0) {
            return Err(LivenessConfigError::InvalidThreshold("ear_threshold", self.ear_threshold));
        }
        if !(self.yaw_threshold_deg > 0.0 && self.yaw_threshold_deg < 90.0) {
            return Err(LivenessConfigError::InvalidThreshold(
                "yaw_threshold_deg",
                self.yaw_threshold_deg,
            ));
        }
        if self.pose_reference_distance <= 0.0 {
            return Err(LivenessConfigError::InvalidThreshold(
                "pose_reference_distance",
                self.pose_reference_distance,
            ));
        }
        if self.steps.contains(&LivenessStep::Blink) && self.blinks_required == 0 {
            return Err(LivenessConfigError::InvalidThreshold("blinks_required", 0.0));
        }
        if let SmileHeuristic::MouthAspect { min_ratio } = self.smile {
            if min_ratio <= 0.0 {
                return Err(LivenessConfigError::InvalidThreshold("smile.min_ratio", min_ratio));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LivenessConfigError {
    #[error("`complete` is a terminal marker, not a configurable step")]
    CompleteInSequence,
    #[error("liveness step {0:?} is duplicated or out of canonical order (blink, turn_left, turn_right, smile)")]
    OutOfOrder(LivenessStep),
    #[error("invalid {0}: {1}")]
    InvalidThreshold(&'static str, f32),
}

/// Liveness progress for one capture session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessState {
    pub current_step: LivenessStep,
    pub completed_steps: Vec<LivenessStep>,
    pub blink_count: u32,
    #[serde(skip)]
    pub last_blink_at: Option<Instant>,
    /// Latest mean EAR, `None` until a face with measurable eyes is seen.
    pub eye_aspect_ratio: Option<f32>,
    pub head_pose: Option<HeadPose>,
    /// 0–100, from the latest detection score only.
    pub quality_score: f32,
    /// 0–100, from the completed fraction of the sequence only.
    pub liveness_score: f32,
}

impl LivenessState {
    pub fn blink_detected(&self) -> bool {
        self.blink_count > 0
    }

    pub fn is_complete(&self) -> bool {
        self.current_step == LivenessStep::Complete
    }
}

/// Step state machine driven by per-frame analyses.
#[derive(Debug, Clone)]
pub struct LivenessEngine {
    config: LivenessConfig,
}

impl LivenessEngine {
    pub fn new(config: LivenessConfig) -> Result<Self, LivenessConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Fresh state for a new session.
    pub fn initial_state(&self) -> LivenessState {
        let completed_steps = Vec::new();
        LivenessState {
            current_step: self.next_step(&completed_steps),
            liveness_score: self.liveness_score(&completed_steps),
            completed_steps,
            blink_count: 0,
            last_blink_at: None,
            eye_aspect_ratio: None,
            head_pose: None,
            quality_score: 0.0,
        }
    }

    /// Fold one tick into the state.
    ///
    /// With no analysis the previous state is returned unchanged. At most one
    /// step completes per tick.
    pub fn update(
        &self,
        prev: &LivenessState,
        analysis: Option<&FrameAnalysis>,
        now: Instant,
    ) -> LivenessState {
        let Some(analysis) = analysis else {
            return prev.clone();
        };
        let landmarks = &analysis.landmarks;
        let mut next = prev.clone();

        if let Some(ear) = mean_eye_aspect_ratio(landmarks) {
            let threshold = self.config.ear_threshold;
            let crossed = prev.eye_aspect_ratio.is_some_and(|p| p >= threshold) && ear < threshold;
            let debounce = Duration::from_millis(self.config.blink_debounce_ms);
            let settled = prev
                .last_blink_at
                .map_or(true, |t| now.saturating_duration_since(t) >= debounce);
            if crossed && settled {
                next.blink_count += 1;
                next.last_blink_at = Some(now);
                tracing::debug!(blinks = next.blink_count, ear, "blink counted");
            }
            next.eye_aspect_ratio = Some(ear);
        }

        let pose = head_pose(landmarks, self.config.pose_reference_distance);
        next.head_pose = Some(pose);

        let step = prev.current_step;
        if step != LivenessStep::Complete && self.step_satisfied(step, &next, landmarks, pose) {
            next.completed_steps.push(step);
            tracing::debug!(?step, yaw = pose.yaw, "liveness step completed");
        }
        next.current_step = self.next_step(&next.completed_steps);

        next.quality_score = (analysis.detection_score * 100.0).clamp(0.0, 100.0);
        next.liveness_score = self.liveness_score(&next.completed_steps);
        next
    }

    fn step_satisfied(
        &self,
        step: LivenessStep,
        state: &LivenessState,
        landmarks: &Landmarks68,
        pose: HeadPose,
    ) -> bool {
        match step {
            LivenessStep::Blink => state.blink_count >= self.config.blinks_required,
            LivenessStep::TurnLeft => pose.yaw < -self.config.yaw_threshold_deg,
            LivenessStep::TurnRight => pose.yaw > self.config.yaw_threshold_deg,
            LivenessStep::Smile => smile_detected(landmarks.mouth(), self.config.smile),
            LivenessStep::Complete => true,
        }
    }

    fn next_step(&self, completed: &[LivenessStep]) -> LivenessStep {
        self.config
            .steps
            .get(completed.len())
            .copied()
            .unwrap_or(LivenessStep::Complete)
    }

    fn liveness_score(&self, completed: &[LivenessStep]) -> f32 {
        if self.config.steps.is_empty() {
            return 100.0;
        }
        (completed.len() as f32 / self.config.steps.len() as f32 * 100.0).clamp(0.0, 100.0)
    }
}

/// EAR for one eye given its six contour points in p1..p6 order.
///
/// Returns `None` for fewer than six points or a zero-width eye.
pub fn eye_aspect_ratio(eye: &[Point]) -> Option<f32> {
    let [p1, p2, p3, p4, p5, p6] = <[Point; 6]>::try_from(eye.get(..6)?).ok()?;
    let width = p1.distance(&p4);
    if width <= f32::EPSILON {
        return None;
    }
    Some((p2.distance(&p6) + p3.distance(&p5)) / (2.0 * width))
}

/// Mean EAR over both eyes.
pub fn mean_eye_aspect_ratio(landmarks: &Landmarks68) -> Option<f32> {
    let left = eye_aspect_ratio(landmarks.left_eye())?;
    let right = eye_aspect_ratio(landmarks.right_eye())?;
    Some((left + right) / 2.0)
}

/// Coarse head pose from landmark geometry.
pub fn head_pose(landmarks: &Landmarks68, reference_distance: f32) -> HeadPose {
    let left_center = Landmarks68::eye_center(landmarks.left_eye());
    let right_center = Landmarks68::eye_center(landmarks.right_eye());
    let eye_mid = left_center.midpoint(&right_center);
    let nose = landmarks.nose_tip();

    let yaw = (nose.x - eye_mid.x).atan2(reference_distance).to_degrees();
    let pitch = (nose.y - eye_mid.y).atan2(reference_distance).to_degrees();

    // Outer corners: first point of the image-left eye, fourth of the image-right eye.
    let outer_left = landmarks.left_eye()[0];
    let outer_right = landmarks.right_eye()[3];
    let roll = (outer_right.y - outer_left.y)
        .atan2(outer_right.x - outer_left.x)
        .to_degrees();

    HeadPose { yaw, pitch, roll }
}

/// Outer-lip width over height (corners 48/54, top 51, bottom 57).
pub fn mouth_aspect_ratio(mouth: &[Point]) -> Option<f32> {
    if mouth.len() < 10 {
        return None;
    }
    let width = mouth[0].distance(&mouth[6]);
    let height = mouth[3].distance(&mouth[9]);
    if height <= f32::EPSILON {
        return None;
    }
    Some(width / height)
}

fn smile_detected(mouth: &[Point], heuristic: SmileHeuristic) -> bool {
    match heuristic {
        SmileHeuristic::LandmarkPresence => {
            !mouth.is_empty() && mouth.iter().all(|p| p.x.is_finite() && p.y.is_finite())
        }
        SmileHeuristic::MouthAspect { min_ratio } => {
            mouth_aspect_ratio(mouth).is_some_and(|r| r >= min_ratio)
        }
    }
}
