//! kosface-capture — Capture session controller.
//!
//! Ties a [`kosface_hw::FrameSource`], a [`kosface_core::FaceAnalyzer`] and a
//! [`SubmissionSink`] together: polls frames, folds analyses into liveness
//! state, and turns an explicit capture into a [`kosface_core::CapturePayload`].

pub mod config;
pub mod controller;
pub mod error;
pub mod sink;

pub use config::{CaptureConfig, ConfigError, Gating, Locale};
pub use controller::{CaptureController, CaptureSnapshot, CaptureStep, Overlay};
pub use error::{step_instruction, CaptureError, SubmissionError};
pub use sink::{JsonFileSink, SubmissionSink};
