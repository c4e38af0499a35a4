//! Frame source boundary used by the capture controller.

use crate::convert::PixelFormat;
use async_trait::async_trait;
use kosface_core::Frame;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("camera not found: {0}")]
    NotFound(String),
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("camera did not become ready within {0:?}")]
    Timeout(Duration),
}

impl CameraError {
    /// Map a device I/O error by errno.
    pub fn from_io(context: &str, err: &io::Error) -> Self {
        let detail = format!("{context}: {err}");
        match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => Self::PermissionDenied(detail),
            Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO) => Self::NotFound(detail),
            Some(_) => Self::Unavailable(detail),
            None => match err.kind() {
                io::ErrorKind::PermissionDenied => Self::PermissionDenied(detail),
                io::ErrorKind::NotFound => Self::NotFound(detail),
                _ => Self::Unavailable(detail),
            },
        }
    }
}

/// Properties of a started stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// A camera-like source of frames with a pull-based "latest frame" accessor.
///
/// Implementations must release the device on `stop()` and on drop.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Acquire the device and resolve once the first frame is available.
    async fn start(&self) -> Result<StreamInfo, CameraError>;

    /// Release the device. No-op when not started.
    fn stop(&self);

    /// Most recent frame, if the stream has produced one.
    fn latest_frame(&self) -> Option<Arc<Frame>>;

    fn is_active(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        let map = |errno| CameraError::from_io("open", &io::Error::from_raw_os_error(errno));
        assert!(matches!(map(libc::EACCES), CameraError::PermissionDenied(_)));
        assert!(matches!(map(libc::EPERM), CameraError::PermissionDenied(_)));
        assert!(matches!(map(libc::ENOENT), CameraError::NotFound(_)));
        assert!(matches!(map(libc::ENODEV), CameraError::NotFound(_)));
        assert!(matches!(map(libc::ENXIO), CameraError::NotFound(_)));
        assert!(matches!(map(libc::EBUSY), CameraError::Unavailable(_)));
        assert!(matches!(map(libc::EIO), CameraError::Unavailable(_)));
    }

    #[test]
    fn test_kind_mapping_without_errno() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(CameraError::from_io("open", &err), CameraError::PermissionDenied(_)));
        let err = io::Error::new(io::ErrorKind::Other, "boom");
        let mapped = CameraError::from_io("stream", &err);
        assert_eq!(mapped, CameraError::Unavailable("stream: boom".into()));
    }
}
