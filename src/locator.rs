//! Brightest-block search over a preprocessed frame
//!
//! The frame is split into a non-overlapping grid of `window x window`
//! blocks. Each block scores the number of pixels whose first channel is
//! above the cutoff; the best block wins, earliest in raster order on ties.
//! Only complete blocks are scanned, a partial strip at the right or bottom
//! edge is ignored.

use serde::Serialize;

use crate::coords::Point2D;
use crate::frame::{Frame, FrameError, PixelFormat};

pub const DEFAULT_WINDOW: u32 = 2;
pub const DEFAULT_PIXEL_CUTOFF: u8 = 100;

/// Outcome of scanning one frame
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Default)]
pub struct Detection {
    /// Block center in the scanned frame's pixel space
    pub point: Option<Point2D>,
    /// Score of the winning block (0 when nothing was found)
    pub score: u32,
}

impl Detection {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_present(&self) -> bool {
        self.point.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BrightnessLocator {
    window: u32,
    cutoff: u8,
}

impl BrightnessLocator {
    /// `window` of 0 is treated as 1
    pub fn new(window: u32, cutoff: u8) -> Self {
        Self {
            window: window.max(1),
            cutoff,
        }
    }

    pub fn locate(&self, frame: &Frame) -> Result<Detection, FrameError> {
        frame.require_format(PixelFormat::Rgb24)?;
        let w = self.window as usize;
        let bpp = frame.format().bytes_per_pixel();
        let cols = frame.width() as usize / w;
        let rows = frame.height() as usize / w;

        let mut best_score = 0u32;
        let mut best: Option<(usize, usize)> = None;

        for by in 0..rows {
            let y = by * w;
            for bx in 0..cols {
                let x = bx * w;
                let mut score = 0u32;
                for yr in y..y + w {
                    let row = frame.row(yr);
                    for xr in x..x + w {
                        if row[xr * bpp] > self.cutoff {
                            score += 1;
                        }
                    }
                }

                if score > best_score {
                    best_score = score;
                    best = Some((x, y));
                }
            }
        }

        Ok(match best {
            Some((x, y)) => Detection {
                point: Some(Point2D::new((x + w / 2) as f64, (y + w / 2) as f64)),
                score: best_score,
            },
            None => Detection::none(),
        })
    }
}

impl Default for BrightnessLocator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_PIXEL_CUTOFF)
    }
}
