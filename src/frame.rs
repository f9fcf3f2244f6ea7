//! Captured frames and the shared "latest frame" slot
//!
//! A [`Frame`] is an immutable, row-major pixel buffer. The capture thread
//! publishes frames into a [`FrameSlot`]; the processing tick takes a
//! snapshot reference and does all pixel work without holding any lock.

use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Pixel layouts a frame buffer can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PixelFormat {
    /// 3 bytes per pixel, R G B
    Rgb24,
    /// 3 bytes per pixel, B G R
    Bgr24,
    /// Packed YUV 4:2:2, 4 bytes per 2 pixels
    Yuyv,
}

impl PixelFormat {
    /// Bytes per pixel (or average for packed formats)
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Bgr24 => 3,
            PixelFormat::Yuyv => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Bgr24 => "BGR24",
            PixelFormat::Yuyv => "YUYV",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("pixel format mismatch: expected {expected}, got {actual}")]
    FormatMismatch {
        expected: PixelFormat,
        actual: PixelFormat,
    },
    #[error("frame has zero width or height")]
    EmptyFrame,
    #[error("stride {stride} is smaller than one row ({min} bytes)")]
    StrideTooSmall { stride: usize, min: usize },
    #[error("pixel buffer holds {actual} bytes, frame needs {needed}")]
    BufferTooSmall { needed: usize, actual: usize },
}

/// An immutable captured or preprocessed image
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    width: u32,
    height: u32,
    stride: usize,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap a pixel buffer, checking that it covers `height` rows of `stride` bytes
    pub fn new(
        width: u32,
        height: u32,
        stride: usize,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyFrame);
        }
        let row_bytes = width as usize * format.bytes_per_pixel();
        if stride < row_bytes {
            return Err(FrameError::StrideTooSmall {
                stride,
                min: row_bytes,
            });
        }
        // The last row does not need its padding
        let needed = stride * (height as usize - 1) + row_bytes;
        if data.len() < needed {
            return Err(FrameError::BufferTooSmall {
                needed,
                actual: data.len(),
            });
        }

        Ok(Self {
            width,
            height,
            stride,
            format,
            data,
        })
    }

    /// Tightly packed RGB24 frame
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        Self::new(width, height, width as usize * 3, PixelFormat::Rgb24, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn size(&self) -> crate::coords::Size {
        crate::coords::Size::new(self.width, self.height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Pixel bytes of row `y`, without stride padding
    #[inline]
    pub fn row(&self, y: usize) -> &[u8] {
        let start = y * self.stride;
        &self.data[start..start + self.width as usize * self.format.bytes_per_pixel()]
    }

    /// Fail fast unless the frame carries `expected`
    pub fn require_format(&self, expected: PixelFormat) -> Result<(), FrameError> {
        if self.format != expected {
            return Err(FrameError::FormatMismatch {
                expected,
                actual: self.format,
            });
        }
        Ok(())
    }

    /// Repack into a contiguous RGB buffer (for JPEG encoding)
    pub fn to_packed_rgb(&self) -> Result<Vec<u8>, FrameError> {
        self.require_format(PixelFormat::Rgb24)?;
        let mut out = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height as usize {
            out.extend_from_slice(self.row(y));
        }
        Ok(out)
    }

    /// Convert any supported layout into a tightly packed RGB24 frame
    pub fn to_rgb24(&self) -> Result<Frame, FrameError> {
        let row_out = self.width as usize * 3;
        let mut rgb = vec![0u8; row_out * self.height as usize];
        for (y, out) in rgb.chunks_exact_mut(row_out).enumerate() {
            let row = self.row(y);
            match self.format {
                PixelFormat::Rgb24 => out.copy_from_slice(row),
                PixelFormat::Bgr24 => bgr_to_rgb(row, out),
                PixelFormat::Yuyv => yuyv_to_rgb(row, out),
            }
        }
        Frame::from_rgb(self.width, self.height, rgb)
    }
}

/// Convert YUYV to RGB using fast integer math (no floating point)
/// Uses fixed-point arithmetic with 8-bit shift for BT.601 color conversion
#[inline]
fn yuyv_to_rgb(yuyv: &[u8], rgb: &mut [u8]) {
    // Process 2 pixels at a time (4 bytes YUYV -> 6 bytes RGB)
    for (src, dst) in yuyv.chunks_exact(4).zip(rgb.chunks_exact_mut(6)) {
        let y0 = src[0] as i32;
        let u = src[1] as i32 - 128;
        let y1 = src[2] as i32;
        let v = src[3] as i32 - 128;

        // R = Y + 1.402 * V           → Y + (359 * V) >> 8
        // G = Y - 0.344 * U - 0.714 * V → Y - (88 * U + 183 * V) >> 8
        // B = Y + 1.772 * U           → Y + (454 * U) >> 8
        let v_r = (359 * v) >> 8;
        let uv_g = (88 * u + 183 * v) >> 8;
        let u_b = (454 * u) >> 8;

        dst[0] = (y0 + v_r).clamp(0, 255) as u8;
        dst[1] = (y0 - uv_g).clamp(0, 255) as u8;
        dst[2] = (y0 + u_b).clamp(0, 255) as u8;

        dst[3] = (y1 + v_r).clamp(0, 255) as u8;
        dst[4] = (y1 - uv_g).clamp(0, 255) as u8;
        dst[5] = (y1 + u_b).clamp(0, 255) as u8;
    }
}

/// Convert BGR to RGB (swap R and B channels)
#[inline]
fn bgr_to_rgb(bgr: &[u8], rgb: &mut [u8]) {
    for (bgr_chunk, rgb_chunk) in bgr.chunks_exact(3).zip(rgb.chunks_exact_mut(3)) {
        rgb_chunk[0] = bgr_chunk[2];
        rgb_chunk[1] = bgr_chunk[1];
        rgb_chunk[2] = bgr_chunk[0];
    }
}

/// A frame snapshot plus the publish sequence it was stored under
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub frame: Arc<Frame>,
    pub sequence: u64,
}

/// Single-slot exchange between the capture thread and the processing tick
///
/// There is no queue: publishing overwrites whatever frame was there.
pub struct FrameSlot {
    latest: ArcSwapOption<FrameSnapshot>,
    published: AtomicU64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            latest: ArcSwapOption::empty(),
            published: AtomicU64::new(0),
        }
    }

    /// Swap in a new frame (called from the capture thread)
    pub fn publish(&self, frame: Frame) {
        let sequence = self.published.fetch_add(1, Ordering::AcqRel) + 1;
        self.latest.store(Some(Arc::new(FrameSnapshot {
            frame: Arc::new(frame),
            sequence,
        })));
    }

    /// Take a reference to the most recent frame, if any has arrived
    pub fn snapshot(&self) -> Option<Arc<FrameSnapshot>> {
        self.latest.load_full()
    }

    /// Number of frames published since creation
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_validation() {
        assert_eq!(
            Frame::from_rgb(0, 4, vec![]).unwrap_err(),
            FrameError::EmptyFrame
        );
        assert_eq!(
            Frame::new(4, 2, 8, PixelFormat::Rgb24, vec![0; 24]).unwrap_err(),
            FrameError::StrideTooSmall { stride: 8, min: 12 }
        );
        assert_eq!(
            Frame::from_rgb(2, 2, vec![0; 11]).unwrap_err(),
            FrameError::BufferTooSmall {
                needed: 12,
                actual: 11
            }
        );
    }

    #[test]
    fn test_padded_rows() {
        // 2x2 RGB with 2 bytes of padding per row, last row unpadded
        let data = vec![1, 1, 1, 2, 2, 2, 0, 0, 3, 3, 3, 4, 4, 4];
        let frame = Frame::new(2, 2, 8, PixelFormat::Rgb24, data).unwrap();
        assert_eq!(frame.row(1), &[3, 3, 3, 4, 4, 4]);
        assert_eq!(
            frame.to_packed_rgb().unwrap(),
            vec![1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4]
        );
    }

    #[test]
    fn test_require_format() {
        let frame = Frame::new(2, 1, 4, PixelFormat::Yuyv, vec![0; 4]).unwrap();
        assert_eq!(
            frame.require_format(PixelFormat::Rgb24).unwrap_err(),
            FrameError::FormatMismatch {
                expected: PixelFormat::Rgb24,
                actual: PixelFormat::Yuyv
            }
        );
    }

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        // U = V = 128 means no color: RGB equals luma
        let frame = Frame::new(2, 1, 4, PixelFormat::Yuyv, vec![50, 128, 200, 128]).unwrap();
        let rgb = frame.to_rgb24().unwrap();
        assert_eq!(rgb.format(), PixelFormat::Rgb24);
        assert_eq!(rgb.data(), &[50, 50, 50, 200, 200, 200]);
    }

    #[test]
    fn test_bgr_rows_with_padding() {
        // 1x2 BGR, one byte of padding after the first row
        let data = vec![0, 128, 255, 9, 1, 2, 3];
        let frame = Frame::new(1, 2, 4, PixelFormat::Bgr24, data).unwrap();
        assert_eq!(frame.to_rgb24().unwrap().data(), &[255, 128, 0, 3, 2, 1]);
    }

    #[test]
    fn test_slot_overwrites_unread_frames() {
        let slot = FrameSlot::new();
        assert!(slot.snapshot().is_none());

        slot.publish(Frame::from_rgb(1, 1, vec![10, 10, 10]).unwrap());
        slot.publish(Frame::from_rgb(1, 1, vec![20, 20, 20]).unwrap());

        let snap = slot.snapshot().unwrap();
        assert_eq!(snap.sequence, 2);
        assert_eq!(snap.frame.data(), &[20, 20, 20]);
        assert_eq!(slot.published(), 2);
    }

    #[test]
    fn test_snapshot_outlives_newer_publish() {
        let slot = FrameSlot::new();
        slot.publish(Frame::from_rgb(1, 1, vec![1, 2, 3]).unwrap());
        let held = slot.snapshot().unwrap();

        slot.publish(Frame::from_rgb(1, 1, vec![4, 5, 6]).unwrap());

        assert_eq!(held.frame.data(), &[1, 2, 3]);
        assert_eq!(slot.snapshot().unwrap().frame.data(), &[4, 5, 6]);
    }

    #[test]
    fn test_concurrent_publish_and_snapshot() {
        const FRAMES: u64 = 500;
        let slot = Arc::new(FrameSlot::new());

        let publisher = {
            let slot = slot.clone();
            std::thread::spawn(move || {
                for i in 0..FRAMES {
                    let v = (i % 256) as u8;
                    slot.publish(Frame::from_rgb(1, 1, vec![v, v, v]).unwrap());
                }
            })
        };

        let mut last_seen = 0;
        loop {
            let done = publisher.is_finished();
            if let Some(snap) = slot.snapshot() {
                // Sequence never goes backwards and always matches its pixels
                assert!(snap.sequence >= last_seen);
                assert_eq!(snap.frame.data()[0], ((snap.sequence - 1) % 256) as u8);
                last_seen = snap.sequence;
            }
            if done {
                break;
            }
        }
        publisher.join().unwrap();

        assert_eq!(slot.snapshot().unwrap().sequence, FRAMES);
        assert_eq!(slot.published(), FRAMES);
    }
}
