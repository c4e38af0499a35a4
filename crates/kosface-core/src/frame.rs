//! RGB frame type shared by the camera, the analyzer and the capture payload.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::time::Instant;

/// A decoded camera frame in packed RGB8 (3 bytes per pixel, row-major).
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
    pub sequence: u32,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Frame {
    /// Wrap an RGB8 buffer, checking that it covers `width * height` pixels.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
            sequence,
        })
    }

    /// Build an RGB frame from 8-bit grayscale by replicating the channel.
    pub fn from_gray(gray: &[u8], width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let pixels = width as usize * height as usize;
        if gray.len() < pixels {
            return Err(FrameError::InvalidLength {
                expected: pixels,
                actual: gray.len(),
            });
        }
        let data = gray[..pixels].iter().flat_map(|&y| [y, y, y]).collect();
        Self::from_rgb(data, width, height, sequence)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// RGB triple at (x, y). Caller guarantees bounds.
    #[inline]
    pub fn rgb_at(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width as usize + x) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Grayscale intensity at (x, y) as the channel mean.
    #[inline]
    pub fn gray_at(&self, x: usize, y: usize) -> f32 {
        let [r, g, b] = self.rgb_at(x, y);
        (r as f32 + g as f32 + b as f32) / 3.0
    }

    /// Average grayscale brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.data.iter().map(|&b| b as u64).sum();
        sum as f32 / self.data.len() as f32
    }

    /// Encode the frame as a baseline JPEG still.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        if self.data.is_empty() || self.width == 0 || self.height == 0 {
            return Err(FrameError::Empty);
        }
        let mut out = Vec::with_capacity(self.data.len() / 8);
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode(&self.data, self.width, self.height, ExtendedColorType::Rgb8)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(out)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("frame is empty")]
    Empty,
    #[error("JPEG encoding failed: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rgb_rejects_short_buffer() {
        let result = Frame::from_rgb(vec![0u8; 10], 2, 2, 0);
        assert!(matches!(
            result,
            Err(FrameError::InvalidLength { expected: 12, actual: 10 })
        ));
    }

    #[test]
    fn test_from_gray_replicates_channels() {
        let frame = Frame::from_gray(&[10, 200], 2, 1, 7).unwrap();
        assert_eq!(frame.data, vec![10, 10, 10, 200, 200, 200]);
        assert_eq!(frame.sequence, 7);
        assert_eq!(frame.gray_at(1, 0), 200.0);
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame::from_gray(&[0, 255, 0, 255], 2, 2, 0).unwrap();
        assert!((frame.avg_brightness() - 127.5).abs() < 1e-3);
    }

    #[test]
    fn test_encode_jpeg_produces_soi_marker() {
        let frame = Frame::from_gray(&vec![128u8; 16 * 16], 16, 16, 0).unwrap();
        let jpeg = frame.encode_jpeg(80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8], "JPEG must start with SOI");
    }

    #[test]
    fn test_encode_jpeg_empty_frame() {
        let frame = Frame {
            data: Vec::new(),
            width: 0,
            height: 0,
            captured_at: Instant::now(),
            sequence: 0,
        };
        assert!(matches!(frame.encode_jpeg(80), Err(FrameError::Empty)));
    }
}
