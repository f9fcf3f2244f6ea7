//! Frame preprocessing: grayscale, binary threshold, nearest-neighbor shrink
//!
//! All stages take and return RGB24 frames so intermediate results can be
//! handed to a preview encoder unchanged. Rows are processed in parallel.

use rayon::prelude::*;

use crate::frame::{Frame, FrameError, PixelFormat};

/// ITU-R BT.709-like luma weights
const LUMA_R: f64 = 0.2125;
const LUMA_G: f64 = 0.7154;
const LUMA_B: f64 = 0.0721;

/// Default binarization cutoff
pub const DEFAULT_THRESHOLD: u8 = 100;

/// Replace every pixel with its luma, keeping three channels (R=G=B)
pub fn grayscale(frame: &Frame) -> Result<Frame, FrameError> {
    frame.require_format(PixelFormat::Rgb24)?;
    let width = frame.width() as usize;
    let out_stride = width * 3;
    let mut out = vec![0u8; out_stride * frame.height() as usize];

    out.par_chunks_exact_mut(out_stride)
        .enumerate()
        .for_each(|(y, dst)| {
            let src = frame.row(y);
            for (s, d) in src.chunks_exact(3).zip(dst.chunks_exact_mut(3)) {
                let luma = LUMA_R * s[0] as f64 + LUMA_G * s[1] as f64 + LUMA_B * s[2] as f64;
                let v = luma as u8;
                d[0] = v;
                d[1] = v;
                d[2] = v;
            }
        });

    Frame::from_rgb(frame.width(), frame.height(), out)
}

/// Binarize: pixels whose intensity exceeds `cutoff` become white, the rest black
///
/// Intensity is the first channel, so the input is expected to be grayscale.
pub fn threshold(frame: &Frame, cutoff: u8) -> Result<Frame, FrameError> {
    frame.require_format(PixelFormat::Rgb24)?;
    let out_stride = frame.width() as usize * 3;
    let mut out = vec![0u8; out_stride * frame.height() as usize];

    out.par_chunks_exact_mut(out_stride)
        .enumerate()
        .for_each(|(y, dst)| {
            let src = frame.row(y);
            for (s, d) in src.chunks_exact(3).zip(dst.chunks_exact_mut(3)) {
                let v = if s[0] > cutoff { u8::MAX } else { u8::MIN };
                d.fill(v);
            }
        });

    Frame::from_rgb(frame.width(), frame.height(), out)
}

/// Output dimensions for a resize by `scale`, never below 1x1
pub fn scaled_dimensions(width: u32, height: u32, scale: f64) -> (u32, u32) {
    let w = (width as f64 * scale).round().max(1.0) as u32;
    let h = (height as f64 * scale).round().max(1.0) as u32;
    (w, h)
}

/// Nearest-neighbor resample to `round(width*scale) x round(height*scale)`
pub fn resize(frame: &Frame, scale: f64) -> Result<Frame, FrameError> {
    frame.require_format(PixelFormat::Rgb24)?;
    let (src_w, src_h) = (frame.width() as usize, frame.height() as usize);
    let (new_w, new_h) = scaled_dimensions(frame.width(), frame.height(), scale);
    let (dst_w, dst_h) = (new_w as usize, new_h as usize);

    let x_factor = src_w as f64 / dst_w as f64;
    let y_factor = src_h as f64 / dst_h as f64;

    // Source column for each destination column, shared by all rows
    let columns: Vec<usize> = (0..dst_w)
        .map(|x| ((x as f64 * x_factor) as usize).min(src_w - 1))
        .collect();

    let out_stride = dst_w * 3;
    let mut out = vec![0u8; out_stride * dst_h];

    out.par_chunks_exact_mut(out_stride)
        .enumerate()
        .for_each(|(y, dst)| {
            let sy = ((y as f64 * y_factor) as usize).min(src_h - 1);
            let src = frame.row(sy);
            for (d, &sx) in dst.chunks_exact_mut(3).zip(&columns) {
                d.copy_from_slice(&src[sx * 3..sx * 3 + 3]);
            }
        });

    Frame::from_rgb(new_w, new_h, out)
}

/// Every intermediate image of one preprocessing pass
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub gray: Frame,
    pub binary: Frame,
    pub shrunk: Frame,
}

/// Grayscale -> threshold -> shrink chain with fixed parameters
#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
    pub cutoff: u8,
    pub scale: f64,
}

impl Preprocessor {
    pub fn new(cutoff: u8, scale: f64) -> Self {
        Self { cutoff, scale }
    }

    pub fn run(&self, frame: &Frame) -> Result<Preprocessed, FrameError> {
        let gray = grayscale(frame)?;
        let binary = threshold(&gray, self.cutoff)?;
        let shrunk = resize(&binary, self.scale)?;
        Ok(Preprocessed {
            gray,
            binary,
            shrunk,
        })
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, 0.4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Frame {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Frame::from_rgb(width, height, data).unwrap()
    }

    #[test]
    fn test_grayscale_weights() {
        let gray = grayscale(&solid(2, 2, [200, 100, 50])).unwrap();
        // 0.2125*200 + 0.7154*100 + 0.0721*50 = 42.5 + 71.54 + 3.605 = 117.645
        assert!(gray.data().iter().all(|&v| v == 117));
        assert_eq!(gray.format(), PixelFormat::Rgb24);
    }

    #[test]
    fn test_grayscale_white_stays_white() {
        let gray = grayscale(&solid(1, 1, [255, 255, 255])).unwrap();
        assert!(gray.data()[0] >= 254);
    }

    #[test]
    fn test_threshold_is_strict() {
        let data = vec![100, 100, 100, 101, 101, 101, 0, 0, 0, 255, 255, 255];
        let frame = Frame::from_rgb(4, 1, data).unwrap();
        let bin = threshold(&frame, 100).unwrap();
        assert_eq!(bin.data(), &[0, 0, 0, 255, 255, 255, 0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn test_resize_dimensions_round() {
        let small = resize(&solid(640, 480, [9, 9, 9]), 0.4).unwrap();
        assert_eq!((small.width(), small.height()), (256, 192));

        // 5 * 0.5 = 2.5 rounds away from zero
        let odd = resize(&solid(5, 3, [1, 1, 1]), 0.5).unwrap();
        assert_eq!((odd.width(), odd.height()), (3, 2));

        let tiny = resize(&solid(2, 2, [1, 1, 1]), 0.01).unwrap();
        assert_eq!((tiny.width(), tiny.height()), (1, 1));
    }

    #[test]
    fn test_resize_nearest_neighbor() {
        // 4x1 image with distinct pixels, halved picks columns 0 and 2
        let data = vec![10, 10, 10, 20, 20, 20, 30, 30, 30, 40, 40, 40];
        let frame = Frame::from_rgb(4, 1, data).unwrap();
        let half = resize(&frame, 0.5).unwrap();
        assert_eq!(half.data(), &[10, 10, 10, 30, 30, 30]);
    }

    #[test]
    fn test_padded_input_is_repacked() {
        let data = vec![255, 255, 255, 0, 0, 0, 0, 0, 255, 255, 255, 0, 0, 0];
        let frame = Frame::new(2, 2, 8, PixelFormat::Rgb24, data).unwrap();
        let bin = threshold(&grayscale(&frame).unwrap(), 100).unwrap();
        assert_eq!(bin.stride(), 6);
        assert_eq!(bin.data(), &[255, 255, 255, 0, 0, 0, 255, 255, 255, 0, 0, 0]);
    }

    #[test]
    fn test_wrong_format_fails_fast() {
        let frame = Frame::new(2, 1, 6, PixelFormat::Bgr24, vec![0; 6]).unwrap();
        let err = Preprocessor::default().run(&frame).unwrap_err();
        assert!(matches!(err, FrameError::FormatMismatch { .. }));
    }

    #[test]
    fn test_pipeline_keeps_intermediates() {
        let out = Preprocessor::new(100, 0.5).run(&solid(8, 6, [255, 255, 255])).unwrap();
        assert_eq!(out.gray.size(), out.binary.size());
        assert_eq!((out.shrunk.width(), out.shrunk.height()), (4, 3));
        assert!(out.shrunk.data().iter().all(|&v| v == 255));
    }
}
