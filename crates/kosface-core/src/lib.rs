//! kosface-core — face analysis and liveness checks for the capture pipeline.
//!
//! Frames go through a [`FaceAnalyzer`] (SCRFD detection, 68-point landmarks
//! and ArcFace descriptors via ONNX Runtime), then through the pure
//! [`LivenessEngine`] and the [`AntiSpoofChecker`] heuristic.

pub mod alignment;
pub mod analyzer;
pub mod antispoof;
pub mod detector;
pub mod frame;
pub mod landmarker;
pub mod liveness;
pub mod models;
pub mod payload;
pub mod recognizer;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod fixtures;

pub use analyzer::{AnalysisError, AnalyzerConfig, FaceAnalyzer, OnnxFaceAnalyzer};
pub use antispoof::{AntiSpoofChecker, AntiSpoofConfig, SpoofRegion, SpoofSignal};
pub use frame::{Frame, FrameError};
pub use liveness::{
    LivenessConfig, LivenessConfigError, LivenessEngine, LivenessState, LivenessStep,
    SmileHeuristic,
};
pub use payload::{CaptureMode, CapturePayload};
pub use types::{Descriptor, FaceBox, FrameAnalysis, HeadPose, Landmarks68, Point};
