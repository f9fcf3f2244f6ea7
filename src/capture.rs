//! Video capture from V4L2 devices
//!
//! The capture thread owns the camera. Every buffer it receives is converted
//! to an RGB24 [`Frame`] and swapped into the shared [`FrameSlot`]; it never
//! waits on the processing side. Losing the device ends the thread with an
//! error, which the host treats as fatal.
//!
//! Performance notes:
//! - MJPEG is decoded with turbojpeg (libjpeg-turbo with SIMD), falling back to jpeg-decoder
//! - YUYV and BGR buffers go through `Frame::to_rgb24` (integer-only math)

use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::config::{CaptureFormat, VideoConfig};
use crate::frame::{Frame, FrameSlot, PixelFormat};

/// Thread-local turbojpeg decompressor for hardware-accelerated MJPEG decoding
thread_local! {
    static JPEG_DECOMPRESSOR: std::cell::RefCell<Option<turbojpeg::Decompressor>> =
        std::cell::RefCell::new(turbojpeg::Decompressor::new().ok());
}

/// Raw buffer layouts the capture loop knows how to convert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputKind {
    Mjpeg,
    Yuyv,
    Rgb,
    Bgr,
}

impl InputKind {
    fn from_fourcc(repr: &[u8; 4]) -> Option<Self> {
        match repr {
            b"MJPG" => Some(InputKind::Mjpeg),
            b"YUYV" => Some(InputKind::Yuyv),
            b"RGB3" => Some(InputKind::Rgb),
            b"BGR3" => Some(InputKind::Bgr),
            _ => None,
        }
    }
}

/// Supported pixel formats in order of preference
fn preferred_formats(preference: CaptureFormat) -> [&'static [u8; 4]; 4] {
    match preference {
        CaptureFormat::Mjpeg => [b"MJPG", b"YUYV", b"RGB3", b"BGR3"],
        CaptureFormat::Yuyv => [b"YUYV", b"MJPG", b"RGB3", b"BGR3"],
    }
}

/// Run the capture loop until the device fails or `shutdown` is set
pub fn run_capture(video: &VideoConfig, slot: Arc<FrameSlot>, shutdown: Arc<AtomicBool>) -> Result<()> {
    info!("Input device: {}", video.input_device);
    info!(
        "Requested resolution: {}x{} @ {} fps",
        video.width, video.height, video.fps
    );

    let dev = Device::with_path(&video.input_device)
        .with_context(|| format!("Failed to open input device: {}", video.input_device))?;

    let caps = dev.query_caps()
        .context("Failed to query device capabilities")?;
    info!("Camera: {} (driver: {})", caps.card, caps.driver);

    let format = configure_capture_format(&dev, video)?;
    info!(
        "Capture format: {}x{} {:?}",
        format.width, format.height,
        String::from_utf8_lossy(&format.fourcc.repr)
    );

    let Some(kind) = InputKind::from_fourcc(&format.fourcc.repr) else {
        bail!(
            "Device delivers unsupported pixel format {:?}",
            String::from_utf8_lossy(&format.fourcc.repr)
        );
    };

    if let Err(e) = set_frame_rate(&dev, video.fps) {
        warn!("Could not set frame rate to {} fps: {}", video.fps, e);
    }

    // Using 4 buffers for smooth capture pipeline
    let mut stream = Stream::with_buffers(&dev, Type::VideoCapture, 4)
        .context("Failed to create capture stream")?;

    if kind == InputKind::Mjpeg {
        JPEG_DECOMPRESSOR.with(|_| {});
        info!("TurboJPEG decompressor initialized");
    }

    info!("Starting capture loop...");

    let mut frame_count = 0u64;
    let mut skipped = 0u64;
    let mut last_stats_time = Instant::now();
    let stats_interval = Duration::from_secs(10);

    while !shutdown.load(Ordering::Relaxed) {
        let (buf, _meta) = stream.next()
            .context("Capture device stopped delivering frames")?;

        match decode_frame(buf, kind, format.width, format.height, format.stride as usize) {
            Some(frame) => slot.publish(frame),
            None => {
                if skipped % 100 == 0 {
                    warn!("Failed to decode {:?} frame", kind);
                }
                skipped += 1;
            }
        }

        frame_count += 1;

        if last_stats_time.elapsed() >= stats_interval {
            let elapsed = last_stats_time.elapsed().as_secs_f64();
            debug!(
                "Capture: {:.1} fps ({} frames in {:.1}s, {} undecodable)",
                frame_count as f64 / elapsed,
                frame_count,
                elapsed,
                skipped
            );
            frame_count = 0;
            skipped = 0;
            last_stats_time = Instant::now();
        }
    }

    info!("Capture loop stopped");
    Ok(())
}

/// Configure the capture format, trying preferred formats in order
fn configure_capture_format(dev: &Device, video: &VideoConfig) -> Result<v4l::Format> {
    let formats = dev.enum_formats()
        .context("Failed to enumerate formats")?;

    info!("Available formats:");
    for fmt in &formats {
        info!("  {:?}: {}", String::from_utf8_lossy(&fmt.fourcc.repr), fmt.description);
    }

    for preferred in preferred_formats(video.format) {
        let fourcc = FourCC::new(preferred);
        if !formats.iter().any(|f| f.fourcc == fourcc) {
            continue;
        }
        info!(
            "Trying format: {:?} at {}x{}",
            String::from_utf8_lossy(preferred),
            video.width,
            video.height
        );

        let mut format = dev.format()
            .context("Failed to get current format")?;
        format.width = video.width;
        format.height = video.height;
        format.fourcc = fourcc;

        match dev.set_format(&format) {
            Ok(actual) => {
                info!("Successfully set format to {}x{} {:?}",
                    actual.width, actual.height,
                    String::from_utf8_lossy(&actual.fourcc.repr));
                return Ok(actual);
            }
            Err(e) => {
                warn!("Could not set format {:?} at {}x{}: {}",
                    String::from_utf8_lossy(preferred), video.width, video.height, e);
            }
        }
    }

    // Fall back to whatever the device gives us
    let current = dev.format().context("Failed to get device format")?;
    info!("Using device's current format: {}x{} {:?}",
        current.width, current.height,
        String::from_utf8_lossy(&current.fourcc.repr));
    Ok(current)
}

/// Set the frame rate on the capture device
fn set_frame_rate(dev: &Device, fps: u32) -> Result<()> {
    let mut params = dev.params()
        .context("Failed to get parameters")?;

    params.interval = v4l::Fraction::new(1, fps);

    dev.set_params(&params)
        .context("Failed to set parameters")?;

    let actual_params = dev.params().context("Failed to read back parameters")?;
    info!("Set frame interval to: {}/{} ({:.1} fps requested: {})",
        actual_params.interval.numerator,
        actual_params.interval.denominator,
        actual_params.interval.denominator as f64 / actual_params.interval.numerator.max(1) as f64,
        fps);

    Ok(())
}

/// Convert one raw buffer into an RGB24 frame
///
/// `stride` is the driver's bytes per line; 0 means tightly packed rows.
fn decode_frame(buf: &[u8], kind: InputKind, width: u32, height: u32, stride: usize) -> Option<Frame> {
    let format = match kind {
        InputKind::Mjpeg => {
            let (jw, jh, rgb) = decode_mjpeg(buf)?;
            return Frame::from_rgb(jw, jh, rgb).ok();
        }
        InputKind::Yuyv => PixelFormat::Yuyv,
        InputKind::Rgb => PixelFormat::Rgb24,
        InputKind::Bgr => PixelFormat::Bgr24,
    };
    let stride = stride.max(width as usize * format.bytes_per_pixel());
    let raw = Frame::new(width, height, stride, format, buf.to_vec()).ok()?;
    match format {
        // Already in processing layout, just drop row padding
        PixelFormat::Rgb24 if stride == width as usize * 3 => Some(raw),
        _ => raw.to_rgb24().ok(),
    }
}

/// Decode an MJPEG frame to RGB using turbojpeg, falling back to jpeg-decoder
fn decode_mjpeg(mjpeg_data: &[u8]) -> Option<(u32, u32, Vec<u8>)> {
    let turbo = JPEG_DECOMPRESSOR.with(|decomp| {
        let mut guard = decomp.borrow_mut();
        let decompressor = guard.as_mut()?;
        let header = decompressor.read_header(mjpeg_data).ok()?;
        let mut pixels = vec![0u8; header.width * header.height * 3];

        let image = turbojpeg::Image {
            pixels: &mut pixels[..],
            width: header.width,
            pitch: header.width * 3,
            height: header.height,
            format: turbojpeg::PixelFormat::RGB,
        };
        decompressor.decompress(mjpeg_data, image).ok()?;
        Some((header.width as u32, header.height as u32, pixels))
    });

    turbo.or_else(|| decode_mjpeg_software(mjpeg_data))
}

/// Software fallback MJPEG decoder using jpeg-decoder crate
fn decode_mjpeg_software(mjpeg_data: &[u8]) -> Option<(u32, u32, Vec<u8>)> {
    use std::io::Cursor;

    let mut decoder = jpeg_decoder::Decoder::new(Cursor::new(mjpeg_data));
    let pixels = decoder.decode().ok()?;
    let info = decoder.info()?;
    let (w, h) = (info.width as u32, info.height as u32);

    match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => Some((w, h, pixels)),
        jpeg_decoder::PixelFormat::L8 => {
            let rgb = pixels.iter().flat_map(|&g| [g, g, g]).collect();
            Some((w, h, rgb))
        }
        _ => None,
    }
}
