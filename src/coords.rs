//! Points, sizes and proportional mapping between coordinate spaces
//!
//! Three spaces are in play: the shrunk working image the detector scans,
//! the full camera frame, and the canonical drawing canvas.

use serde::{Deserialize, Serialize};

/// A 2D point; which space it lives in is tracked by the caller
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Pixel dimensions of a coordinate space
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Corners of `[0,width]x[0,height]`: top-left, top-right, bottom-right, bottom-left
    pub fn corners(&self) -> [Point2D; 4] {
        let w = self.width as f64;
        let h = self.height as f64;
        [
            Point2D::new(0.0, 0.0),
            Point2D::new(w, 0.0),
            Point2D::new(w, h),
            Point2D::new(0.0, h),
        ]
    }
}

/// Rescale `p` from `source` to `target`, independently per axis
#[inline]
pub fn map_point(p: Point2D, source: Size, target: Size) -> Point2D {
    Point2D {
        x: target.width as f64 * (p.x / source.width as f64),
        y: target.height as f64 * (p.y / source.height as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_point() {
        let p = map_point(
            Point2D::new(5.0, 5.0),
            Size::new(10, 10),
            Size::new(100, 50),
        );
        assert_eq!(p, Point2D::new(50.0, 25.0));
    }

    #[test]
    fn test_map_point_upscales_shrunk_detection() {
        // 256x192 is the 0.4 shrink of a 640x480 frame
        let p = map_point(
            Point2D::new(128.0, 96.0),
            Size::new(256, 192),
            Size::new(640, 480),
        );
        assert!((p.x - 320.0).abs() < 1e-9);
        assert!((p.y - 240.0).abs() < 1e-9);
    }

    #[test]
    fn test_corners_order() {
        let c = Size::new(640, 480).corners();
        assert_eq!(c[0], Point2D::new(0.0, 0.0));
        assert_eq!(c[1], Point2D::new(640.0, 0.0));
        assert_eq!(c[2], Point2D::new(640.0, 480.0));
        assert_eq!(c[3], Point2D::new(0.0, 480.0));
    }
}
