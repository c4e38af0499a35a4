//! Face alignment via 4-DOF similarity transform.
//!
//! Maps five facial keypoints onto the InsightFace 112×112 reference layout
//! and resamples the RGB frame into an aligned crop for descriptor extraction.

use crate::frame::Frame;

/// ArcFace reference keypoints for a 112×112 crop.
pub(crate) const REFERENCE_KEYPOINTS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose tip
    (41.5493, 92.3655), // left mouth corner
    (70.7299, 92.2041), // right mouth corner
];

pub(crate) const ALIGNED_SIZE: usize = 112;

/// Similarity transform `dst = [[a, -b], [b, a]] * src + [tx, ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares fit from `src` to `dst` in closed form.
    ///
    /// Centering both point sets decouples translation; the remaining
    /// rotation-scale pair solves directly from cross sums.
    pub fn estimate(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Self {
        let n = src.len().min(dst.len());
        if n == 0 {
            return Self::identity();
        }
        let mean = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts[..n].iter().fold((0.0, 0.0), |(ax, ay), p| (ax + p.0, ay + p.1));
            (sx / n as f32, sy / n as f32)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let mut norm = 0.0f32;
        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        for i in 0..n {
            let (sx, sy) = (src[i].0 - msx, src[i].1 - msy);
            let (dx, dy) = (dst[i].0 - mdx, dst[i].1 - mdy);
            norm += sx * sx + sy * sy;
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
        }
        if norm < 1e-12 {
            return Self::identity();
        }
        let a = dot / norm;
        let b = cross / norm;
        Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        }
    }

    pub fn identity() -> Self {
        Self { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    /// Inverse map, or `None` for a degenerate (zero-scale) transform.
    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (ia, ib) = (self.a / det, -self.b / det);
        Some(Self {
            a: ia,
            b: ib,
            tx: -(ia * self.tx - ib * self.ty),
            ty: -(ib * self.tx + ia * self.ty),
        })
    }
}

/// Bilinear RGB sample with black outside the frame.
pub(crate) fn sample_rgb(frame: &Frame, x: f32, y: f32) -> [f32; 3] {
    let (w, h) = (frame.width as i64, frame.height as i64);
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let mut out = [0.0f32; 3];
    for (dy, wy) in [(0, 1.0 - fy), (1, fy)] {
        for (dx, wx) in [(0, 1.0 - fx), (1, fx)] {
            let (px, py) = (x0 + dx, y0 + dy);
            if px < 0 || py < 0 || px >= w || py >= h {
                continue;
            }
            let rgb = frame.rgb_at(px as usize, py as usize);
            for c in 0..3 {
                out[c] += rgb[c] as f32 * wx * wy;
            }
        }
    }
    out
}

/// Warp the face described by `keypoints` into a 112×112 RGB crop.
pub fn align_face(frame: &Frame, keypoints: &[(f32, f32); 5]) -> Vec<u8> {
    let forward = Similarity::estimate(keypoints, &REFERENCE_KEYPOINTS_112);
    let mut out = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE * 3];
    let Some(back) = forward.inverse() else {
        return out;
    };

    for oy in 0..ALIGNED_SIZE {
        for ox in 0..ALIGNED_SIZE {
            let (sx, sy) = back.apply((ox as f32, oy as f32));
            let rgb = sample_rgb(frame, sx, sy);
            let i = (oy * ALIGNED_SIZE + ox) * 3;
            for c in 0..3 {
                out[i + c] = rgb[c].round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::flat_frame;

    #[test]
    fn test_estimate_identity() {
        let t = Similarity::estimate(&REFERENCE_KEYPOINTS_112, &REFERENCE_KEYPOINTS_112);
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3, "t = ({}, {})", t.tx, t.ty);
    }

    #[test]
    fn test_estimate_half_scale() {
        let src: Vec<(f32, f32)> = REFERENCE_KEYPOINTS_112
            .iter()
            .map(|&(x, y)| (x * 2.0 + 10.0, y * 2.0 - 4.0))
            .collect();
        let t = Similarity::estimate(&src, &REFERENCE_KEYPOINTS_112);
        assert!((t.a - 0.5).abs() < 1e-4, "a = {}", t.a);
        for (s, d) in src.iter().zip(REFERENCE_KEYPOINTS_112.iter()) {
            let (x, y) = t.apply(*s);
            assert!((x - d.0).abs() < 1e-2 && (y - d.1).abs() < 1e-2);
        }
    }

    #[test]
    fn test_estimate_rotation() {
        // 90° rotation: (x, y) → (-y, x)
        let src = [(1.0, 0.0), (0.0, 1.0), (-1.0, 0.0), (0.0, -1.0), (2.0, 2.0)];
        let dst: Vec<(f32, f32)> = src.iter().map(|&(x, y)| (-y, x)).collect();
        let t = Similarity::estimate(&src, &dst);
        assert!(t.a.abs() < 1e-5 && (t.b - 1.0).abs() < 1e-5, "a={} b={}", t.a, t.b);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = Similarity { a: 0.8, b: 0.3, tx: 5.0, ty: -2.0 };
        let inv = t.inverse().unwrap();
        let p = (13.0, 7.5);
        let (x, y) = inv.apply(t.apply(p));
        assert!((x - p.0).abs() < 1e-4 && (y - p.1).abs() < 1e-4);
        assert!(Similarity { a: 0.0, b: 0.0, tx: 1.0, ty: 1.0 }.inverse().is_none());
    }

    #[test]
    fn test_align_output_size_and_fill() {
        let frame = flat_frame(640, 480, 90);
        let kps = [(300.0, 200.0), (340.0, 200.0), (320.0, 225.0), (305.0, 250.0), (335.0, 250.0)];
        let aligned = align_face(&frame, &kps);
        assert_eq!(aligned.len(), ALIGNED_SIZE * ALIGNED_SIZE * 3);
        // The centre of the crop lies well inside a uniform frame.
        let c = (56 * ALIGNED_SIZE + 56) * 3;
        assert_eq!(&aligned[c..c + 3], &[90, 90, 90]);
    }

    #[test]
    fn test_align_moves_keypoint_patch_to_reference() {
        let mut frame = flat_frame(200, 200, 0);
        let kps = [(80.0, 60.0), (120.0, 60.0), (100.0, 85.0), (85.0, 110.0), (115.0, 110.0)];
        for y in 58..63 {
            for x in 78..83 {
                let i = (y * 200 + x) * 3;
                frame.data[i..i + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
        let aligned = align_face(&frame, &kps);
        let (rx, ry) = (
            REFERENCE_KEYPOINTS_112[0].0.round() as usize,
            REFERENCE_KEYPOINTS_112[0].1.round() as usize,
        );
        let mut brightest = 0u8;
        for y in ry - 1..=ry + 1 {
            for x in rx - 1..=rx + 1 {
                brightest = brightest.max(aligned[(y * ALIGNED_SIZE + x) * 3]);
            }
        }
        assert!(brightest > 100, "patch should land near the reference left eye, max={brightest}");
    }
}
