//! Calibration phases, anchor storage and calibration errors

use serde::Serialize;
use thiserror::Error;

use crate::coords::{Point2D, Size};

/// Which side of the anchor quadrilateral broke the homography
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegenerateReason {
    /// Three anchors lie on one line (or two coincide)
    Collinear { indices: [usize; 3] },
    /// Opposite edges of the quadrilateral cross
    SelfIntersecting,
    /// One anchor lies inside the triangle of the other three
    Concave,
    /// The linear system could not be solved
    Singular,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Serialize)]
pub enum CalibrationError {
    #[error("degenerate calibration: {0:?}")]
    Degenerate(DegenerateReason),
    #[error("anchor set incomplete: {filled} of 4 corners acquired")]
    Incomplete { filled: usize },
    #[error("anchor slot {index} cannot be filled before slot {expected}")]
    OutOfOrder { index: usize, expected: usize },
}

/// The four screen corners, in acquisition order
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomRight,
    BottomLeft,
}

impl Corner {
    pub const ALL: [Corner; 4] = [
        Corner::TopLeft,
        Corner::TopRight,
        Corner::BottomRight,
        Corner::BottomLeft,
    ];

    pub fn from_index(index: usize) -> Option<Corner> {
        Self::ALL.get(index).copied()
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn label(&self) -> &'static str {
        match self {
            Corner::TopLeft => "Top Left",
            Corner::TopRight => "Top Right",
            Corner::BottomRight => "Bottom Right",
            Corner::BottomLeft => "Bottom Left",
        }
    }

    /// Where to draw the "point here" marker on a canvas of `size`
    pub fn guidance_marker(&self, size: Size, inset: f64) -> Point2D {
        let (w, h) = (size.width as f64, size.height as f64);
        match self {
            Corner::TopLeft => Point2D::new(inset, inset),
            Corner::TopRight => Point2D::new(w - inset, inset),
            Corner::BottomRight => Point2D::new(w - inset, h - inset),
            Corner::BottomLeft => Point2D::new(inset, h - inset),
        }
    }
}

/// Where the session is in the calibrate-then-draw cycle
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(tag = "phase", content = "corner", rename_all = "snake_case")]
pub enum CalibrationPhase {
    #[default]
    Idle,
    AcquiringCorner(Corner),
    Calibrated,
}

impl CalibrationPhase {
    pub fn corner(&self) -> Option<Corner> {
        match self {
            CalibrationPhase::AcquiringCorner(c) => Some(*c),
            _ => None,
        }
    }
}

/// Camera-space anchors, filled strictly in corner order
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Default)]
pub struct AnchorSet {
    slots: [Option<Point2D>; 4],
}

impl AnchorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots filled so far
    pub fn filled(&self) -> usize {
        self.slots.iter().take_while(|s| s.is_some()).count()
    }

    /// Store the anchor for `corner`, which must be the next empty slot
    pub fn set(&mut self, corner: Corner, point: Point2D) -> Result<(), CalibrationError> {
        let expected = self.filled();
        if corner.index() != expected {
            return Err(CalibrationError::OutOfOrder {
                index: corner.index(),
                expected,
            });
        }
        self.slots[expected] = Some(point);
        Ok(())
    }

    pub fn get(&self, corner: Corner) -> Option<Point2D> {
        self.slots[corner.index()]
    }

    pub fn clear(&mut self) {
        self.slots = [None; 4];
    }

    pub fn complete(&self) -> Result<[Point2D; 4], CalibrationError> {
        match self.slots {
            [Some(a), Some(b), Some(c), Some(d)] => Ok([a, b, c, d]),
            _ => Err(CalibrationError::Incomplete {
                filled: self.filled(),
            }),
        }
    }

    /// Anchors as they would be with `point` in the next slot, without storing it
    pub fn with_next(&self, point: Point2D) -> AnchorSet {
        let mut next = *self;
        let filled = self.filled();
        if filled < 4 {
            next.slots[filled] = Some(point);
        }
        next
    }
}
