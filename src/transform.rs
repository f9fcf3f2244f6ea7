//! Perspective transformation for the drawing surface
//!
//! This module builds the homography that maps the quadrilateral marked out
//! by the four calibration anchors in the camera image onto the full
//! rectangle of the camera frame, and applies it to single points. The
//! full-image warp is only used to render a rectified preview.

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use rayon::prelude::*;

use crate::calibration::{CalibrationError, DegenerateReason};
use crate::coords::{Point2D, Size};
use crate::frame::{Frame, FrameError, PixelFormat};

/// Minimum |sin| of the angle at any anchor triple before it counts as collinear
const COLLINEAR_EPS: f64 = 1e-6;

/// Perspective transformation matrix (3x3 homography)
#[derive(Debug, Clone, PartialEq)]
pub struct PerspectiveTransform {
    /// Source quadrilateral -> destination rectangle, h33 = 1
    matrix: Matrix3<f64>,
    /// Rectangle -> quadrilateral, used for warping
    inverse: Matrix3<f64>,
    /// Canonical rectangle the anchors map onto
    target: Size,
}

impl PerspectiveTransform {
    /// Map `anchors` (top-left, top-right, bottom-right, bottom-left) onto
    /// the corners of `[0,target.width]x[0,target.height]`
    pub fn from_anchors(anchors: [Point2D; 4], target: Size) -> Result<Self, CalibrationError> {
        check_quadrilateral(&anchors)?;

        let dst = target.corners();
        let matrix = compute_homography(&anchors, &dst)
            .ok_or(CalibrationError::Degenerate(DegenerateReason::Singular))?;
        let inverse = matrix
            .try_inverse()
            .ok_or(CalibrationError::Degenerate(DegenerateReason::Singular))?;

        Ok(Self {
            matrix,
            inverse,
            target,
        })
    }

    /// Project a camera-space point into the canonical rectangle
    ///
    /// Returns `None` for points on the vanishing line of the transform.
    #[inline]
    pub fn apply(&self, p: Point2D) -> Option<Point2D> {
        apply_homography(&self.matrix, p)
    }

    /// Map a canonical-rectangle point back into camera space
    #[inline]
    pub fn apply_inverse(&self, p: Point2D) -> Option<Point2D> {
        apply_homography(&self.inverse, p)
    }

    pub fn target(&self) -> Size {
        self.target
    }

    /// Row-major matrix entries
    pub fn to_array(&self) -> [[f64; 3]; 3] {
        let h = &self.matrix;
        [
            [h[(0, 0)], h[(0, 1)], h[(0, 2)]],
            [h[(1, 0)], h[(1, 1)], h[(1, 2)]],
            [h[(2, 0)], h[(2, 1)], h[(2, 2)]],
        ]
    }

    /// Rectify an RGB frame into a `target`-sized frame
    /// Uses bilinear interpolation for smooth output
    pub fn warp_rgb(&self, src: &Frame) -> Result<Frame, FrameError> {
        src.require_format(PixelFormat::Rgb24)?;
        let dst_w = self.target.width as usize;
        let dst_h = self.target.height as usize;
        let channels = 3;
        let dst_stride = dst_w * channels;
        let mut dst = vec![0u8; dst_stride * dst_h];

        dst.par_chunks_exact_mut(dst_stride)
            .enumerate()
            .for_each(|(dst_y, row)| {
                for dst_x in 0..dst_w {
                    // Map destination pixel to source coordinates
                    let Some(p) = self.apply_inverse(Point2D::new(dst_x as f64, dst_y as f64))
                    else {
                        continue;
                    };
                    let pixel = bilinear_sample(src, channels, p.x, p.y);
                    let offset = dst_x * channels;
                    row[offset..offset + channels].copy_from_slice(&pixel[..channels]);
                }
            });

        Frame::from_rgb(self.target.width, self.target.height, dst)
    }
}

/// Reject anchor sets with a collinear triple, crossing edges or a reflex corner
fn check_quadrilateral(p: &[Point2D; 4]) -> Result<(), CalibrationError> {
    for (a, b, c) in [(0, 1, 2), (0, 1, 3), (0, 2, 3), (1, 2, 3)] {
        let (ab, ac) = (sub(p[b], p[a]), sub(p[c], p[a]));
        let scale = (ab.0.hypot(ab.1)) * (ac.0.hypot(ac.1));
        if cross(ab, ac).abs() <= COLLINEAR_EPS * scale {
            return Err(CalibrationError::Degenerate(DegenerateReason::Collinear {
                indices: [a, b, c],
            }));
        }
    }

    // With no collinear triple, a crossing means opposite edges straddle each other
    if segments_cross(p[0], p[1], p[2], p[3]) || segments_cross(p[1], p[2], p[3], p[0]) {
        return Err(CalibrationError::Degenerate(
            DegenerateReason::SelfIntersecting,
        ));
    }

    // A simple quad is convex when every turn goes the same way; otherwise the
    // vanishing line of the homography passes through the drawing area
    let turns: Vec<f64> = (0..4)
        .map(|i| cross(sub(p[(i + 1) % 4], p[i]), sub(p[(i + 2) % 4], p[(i + 1) % 4])))
        .collect();
    if turns.iter().any(|t| t.signum() != turns[0].signum()) {
        return Err(CalibrationError::Degenerate(DegenerateReason::Concave));
    }

    Ok(())
}

#[inline]
fn sub(a: Point2D, b: Point2D) -> (f64, f64) {
    (a.x - b.x, a.y - b.y)
}

#[inline]
fn cross(u: (f64, f64), v: (f64, f64)) -> f64 {
    u.0 * v.1 - u.1 * v.0
}

fn segments_cross(a: Point2D, b: Point2D, c: Point2D, d: Point2D) -> bool {
    let d1 = cross(sub(b, a), sub(c, a));
    let d2 = cross(sub(b, a), sub(d, a));
    let d3 = cross(sub(d, c), sub(a, c));
    let d4 = cross(sub(d, c), sub(b, c));
    d1.signum() != d2.signum() && d3.signum() != d4.signum()
}

/// Compute a 3x3 homography matrix from 4 point correspondences
///
/// For each correspondence (x,y) -> (x',y') with h33 = 1:
/// h11*x + h12*y + h13 - x'*x*h31 - x'*y*h32 = x'
/// h21*x + h22*y + h23 - y'*x*h31 - y'*y*h32 = y'
fn compute_homography(src: &[Point2D; 4], dst: &[Point2D; 4]) -> Option<Matrix3<f64>> {
    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();

    for i in 0..4 {
        let (x, y) = (src[i].x, src[i].y);
        let (xp, yp) = (dst[i].x, dst[i].y);
        let r1 = i * 2;
        let r2 = r1 + 1;

        a[(r1, 0)] = x;
        a[(r1, 1)] = y;
        a[(r1, 2)] = 1.0;
        a[(r1, 6)] = -xp * x;
        a[(r1, 7)] = -xp * y;
        b[r1] = xp;

        a[(r2, 3)] = x;
        a[(r2, 4)] = y;
        a[(r2, 5)] = 1.0;
        a[(r2, 6)] = -yp * x;
        a[(r2, 7)] = -yp * y;
        b[r2] = yp;
    }

    let h = a.lu().solve(&b)?;
    if h.iter().any(|v| !v.is_finite()) {
        return None;
    }

    Some(Matrix3::new(
        h[0], h[1], h[2], //
        h[3], h[4], h[5], //
        h[6], h[7], 1.0,
    ))
}

/// Apply a homography matrix to a point
#[inline]
fn apply_homography(h: &Matrix3<f64>, p: Point2D) -> Option<Point2D> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    if v[2].abs() < 1e-10 {
        return None;
    }
    Some(Point2D::new(v[0] / v[2], v[1] / v[2]))
}

/// Bilinear interpolation sampling
#[inline]
fn bilinear_sample(src: &Frame, channels: usize, x: f64, y: f64) -> [u8; 4] {
    let width = src.width() as usize;
    let height = src.height() as usize;
    let stride = src.stride();
    let data = src.data();

    // Clamp coordinates
    let x = x.max(0.0).min((width - 1) as f64);
    let y = y.max(0.0).min((height - 1) as f64);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let mut result = [0u8; 4];

    for c in 0..channels.min(4) {
        let p00 = data.get(y0 * stride + x0 * channels + c).copied().unwrap_or(0) as f64;
        let p10 = data.get(y0 * stride + x1 * channels + c).copied().unwrap_or(0) as f64;
        let p01 = data.get(y1 * stride + x0 * channels + c).copied().unwrap_or(0) as f64;
        let p11 = data.get(y1 * stride + x1 * channels + c).copied().unwrap_or(0) as f64;

        let value = p00 * (1.0 - fx) * (1.0 - fy)
            + p10 * fx * (1.0 - fy)
            + p01 * (1.0 - fx) * fy
            + p11 * fx * fy;

        result[c] = value.round().clamp(0.0, 255.0) as u8;
    }

    result
}
