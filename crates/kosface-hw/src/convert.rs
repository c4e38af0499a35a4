//! Pixel-format conversion to packed RGB8 and dark-frame detection.

use image::ImageFormat;
use kosface_core::Frame;
use thiserror::Error;
use v4l::FourCC;

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpg,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpg),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    pub fn fourcc(self) -> FourCC {
        FourCC::new(match self {
            Self::Yuyv => b"YUYV",
            Self::Mjpg => b"MJPG",
            Self::Grey => b"GREY",
            Self::Y16 => b"Y16 ",
        })
    }
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("{format:?} buffer too short: expected {expected}, got {actual}")]
    ShortBuffer {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
    #[error("MJPG decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// Decoded RGB8 image with its actual dimensions.
#[derive(Debug)]
pub struct Rgb8 {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Convert one raw buffer to RGB8.
///
/// `width`/`height` are the negotiated dimensions; MJPG reports the size of
/// the decoded JPEG instead.
pub fn to_rgb(format: PixelFormat, buf: &[u8], width: u32, height: u32) -> Result<Rgb8, ConvertError> {
    let pixels = (width * height) as usize;
    let check = |expected: usize| {
        if buf.len() < expected {
            Err(ConvertError::ShortBuffer { format, expected, actual: buf.len() })
        } else {
            Ok(())
        }
    };

    let data = match format {
        PixelFormat::Yuyv => {
            check(pixels * 2)?;
            yuyv_to_rgb(&buf[..pixels * 2])
        }
        PixelFormat::Grey => {
            check(pixels)?;
            buf[..pixels].iter().flat_map(|&g| [g, g, g]).collect()
        }
        PixelFormat::Y16 => {
            check(pixels * 2)?;
            // Keep the high byte of each little-endian sample.
            buf[..pixels * 2]
                .chunks_exact(2)
                .flat_map(|px| [px[1], px[1], px[1]])
                .collect()
        }
        PixelFormat::Mjpg => {
            let img = image::load_from_memory_with_format(buf, ImageFormat::Jpeg)?.to_rgb8();
            let (width, height) = img.dimensions();
            return Ok(Rgb8 { data: img.into_raw(), width, height });
        }
    };
    Ok(Rgb8 { data, width, height })
}

/// BT.601 limited-range YUYV → RGB8.
///
/// Each 4-byte group `[Y0, U, Y1, V]` yields two pixels sharing chroma.
pub fn yuyv_to_rgb(yuyv: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(yuyv.len() / 2 * 3);
    for group in yuyv.chunks_exact(4) {
        let (u, v) = (group[1] as i32 - 128, group[3] as i32 - 128);
        for y in [group[0], group[2]] {
            let c = 298 * (y as i32 - 16);
            out.push(clamp_u8((c + 409 * v + 128) >> 8));
            out.push(clamp_u8((c - 100 * u - 208 * v + 128) >> 8));
            out.push(clamp_u8((c + 516 * u + 128) >> 8));
        }
    }
    out
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// True if more than `threshold_pct` of pixels fall in the darkest bucket (0–31).
pub fn is_dark_frame(frame: &Frame, threshold_pct: f32) -> bool {
    let total = frame.pixel_count();
    if total == 0 {
        return true;
    }
    let dark = frame
        .data
        .chunks_exact(3)
        .filter(|px| (px[0] as u16 + px[1] as u16 + px[2] as u16) / 3 < 32)
        .count();
    (dark as f32 / total as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_black_white_gray() {
        // [Y0, U, Y1, V] with neutral chroma
        let rgb = yuyv_to_rgb(&[16, 128, 235, 128, 126, 128, 126, 128]);
        assert_eq!(&rgb[0..3], &[0, 0, 0]);
        assert_eq!(&rgb[3..6], &[255, 255, 255]);
        assert_eq!(&rgb[6..9], &[128, 128, 128]);
        assert_eq!(rgb.len(), 12);
    }

    #[test]
    fn test_yuyv_red_chroma() {
        let rgb = yuyv_to_rgb(&[81, 90, 81, 240]);
        assert!(rgb[0] > 230 && rgb[1] < 30 && rgb[2] < 30, "got {:?}", &rgb[..3]);
    }

    #[test]
    fn test_grey_and_y16_expand_to_rgb() {
        let grey = to_rgb(PixelFormat::Grey, &[10, 20], 2, 1).unwrap();
        assert_eq!(grey.data, vec![10, 10, 10, 20, 20, 20]);

        let y16 = to_rgb(PixelFormat::Y16, &[0xff, 0x80, 0x00, 0x01], 2, 1).unwrap();
        assert_eq!(y16.data, vec![0x80, 0x80, 0x80, 0x01, 0x01, 0x01]);
    }

    #[test]
    fn test_short_buffer() {
        let err = to_rgb(PixelFormat::Yuyv, &[0; 6], 2, 2).unwrap_err();
        assert!(matches!(err, ConvertError::ShortBuffer { expected: 8, actual: 6, .. }));
    }

    #[test]
    fn test_mjpg_decode_reports_jpeg_dimensions() {
        let frame = Frame::from_rgb(vec![200; 16 * 8 * 3], 16, 8, 0).unwrap();
        let jpeg = frame.encode_jpeg(90).unwrap();
        // Negotiated size is ignored for MJPG.
        let rgb = to_rgb(PixelFormat::Mjpg, &jpeg, 640, 480).unwrap();
        assert_eq!((rgb.width, rgb.height), (16, 8));
        assert_eq!(rgb.data.len(), 16 * 8 * 3);
        assert!(rgb.data.iter().all(|&v| (190..=210).contains(&v)));

        assert!(matches!(
            to_rgb(PixelFormat::Mjpg, b"not a jpeg", 2, 2),
            Err(ConvertError::Decode(_))
        ));
    }

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"NV12")), None);
        assert_eq!(PixelFormat::from_fourcc(PixelFormat::Mjpg.fourcc()), Some(PixelFormat::Mjpg));
    }

    #[test]
    fn test_dark_frame() {
        let black = Frame::from_rgb(vec![0; 100 * 3], 10, 10, 0).unwrap();
        assert!(is_dark_frame(&black, 0.95));

        let mut data = vec![10u8; 94 * 3];
        data.extend(vec![128u8; 6 * 3]);
        let mostly_dark = Frame::from_rgb(data, 10, 10, 0).unwrap();
        assert!(!is_dark_frame(&mostly_dark, 0.95));
    }
}
