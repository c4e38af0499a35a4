//! kosface-hw — Camera frame sources for the capture pipeline.
//!
//! Provides the [`FrameSource`] boundary and a V4L2-backed [`Camera`]
//! that decodes YUYV, MJPG, GREY and Y16 streams to RGB8 frames.

pub mod camera;
pub mod convert;
pub mod source;

pub use camera::{Camera, CameraConfig, DeviceInfo};
pub use convert::PixelFormat;
pub use source::{CameraError, FrameSource, StreamInfo};
