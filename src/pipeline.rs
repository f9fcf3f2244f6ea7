//! Fixed-rate processing tick
//!
//! Each tick drains pending commands, snapshots the latest captured frame,
//! runs preprocess -> locate -> session, and publishes a [`TickReport`] (and
//! optionally preview JPEGs) for the web UI. Pixel work never happens while
//! anything is locked.

use anyhow::{Context, Result};
use imageproc::drawing::draw_hollow_circle_mut;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::calibration::{AnchorSet, CalibrationError, CalibrationPhase, Corner};
use crate::config::{Config, PreviewConfig};
use crate::coords::{map_point, Point2D, Size};
use crate::frame::{Frame, FrameError, FrameSlot};
use crate::locator::{BrightnessLocator, Detection};
use crate::preprocess::{Preprocessed, Preprocessor};
use crate::server::AppState;
use crate::session::{Command, SessionEvent, TrackingSession};
use crate::stroke::StrokeSnapshot;

/// Inset of the on-canvas guidance markers, in canvas pixels
const MARKER_INSET: f64 = 10.0;

/// Everything a renderer needs after one tick
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    /// Capture sequence number of the processed frame (0 before the first)
    pub sequence: u64,
    pub frame_size: Option<Size>,
    pub scanned_size: Option<Size>,
    /// Detection in scanned-image pixels
    pub detection: Detection,
    /// The same detection in camera pixels
    pub camera_point: Option<Point2D>,
    pub phase: CalibrationPhase,
    pub anchors: AnchorSet,
    /// Row-major homography, present once calibrated
    pub transform: Option<[[f64; 3]; 3]>,
    /// Canvas position of the corner to point at next
    pub guidance_marker: Option<Point2D>,
    pub rejected: Option<CalibrationError>,
    pub canvas: Size,
    pub stroke_len: usize,
    #[serde(skip)]
    pub stroke: StrokeSnapshot,
}

impl TickReport {
    /// Report before any frame has been processed
    pub fn initial(canvas: Size) -> Self {
        Self {
            sequence: 0,
            frame_size: None,
            scanned_size: None,
            detection: Detection::none(),
            camera_point: None,
            phase: CalibrationPhase::Idle,
            anchors: AnchorSet::new(),
            transform: None,
            guidance_marker: None,
            rejected: None,
            canvas,
            stroke_len: 0,
            stroke: StrokeSnapshot::default(),
        }
    }
}

/// Preprocessing, detection and session state for the processing thread
pub struct Tracker {
    preprocessor: Preprocessor,
    locator: BrightnessLocator,
    session: TrackingSession,
    sequence: u64,
    frame_size: Option<Size>,
    scanned_size: Option<Size>,
    detection: Detection,
}

impl Tracker {
    pub fn new(config: &Config) -> Self {
        let t = &config.tracking;
        Self {
            preprocessor: Preprocessor::new(t.threshold, t.scale_factor),
            locator: BrightnessLocator::new(t.window_size, t.brightness_threshold),
            session: TrackingSession::new(config.canvas.size()),
            sequence: 0,
            frame_size: None,
            scanned_size: None,
            detection: Detection::none(),
        }
    }

    pub fn session(&self) -> &TrackingSession {
        &self.session
    }

    pub fn apply(&mut self, command: Command) {
        info!("Command: {:?}", command);
        self.session.apply(command);
    }

    /// Run one frame through the pipeline
    pub fn process(
        &mut self,
        frame: &Frame,
        sequence: u64,
    ) -> Result<(Preprocessed, SessionEvent), FrameError> {
        let pre = self.preprocessor.run(frame)?;
        let detection = self.locator.locate(&pre.shrunk)?;
        let event = self
            .session
            .observe(&detection, pre.shrunk.size(), frame.size());

        self.sequence = sequence;
        self.frame_size = Some(frame.size());
        self.scanned_size = Some(pre.shrunk.size());
        self.detection = detection;

        Ok((pre, event))
    }

    pub fn report(&self) -> TickReport {
        let camera_point = match (self.detection.point, self.scanned_size, self.frame_size) {
            (Some(p), Some(scanned), Some(camera)) => Some(map_point(p, scanned, camera)),
            _ => None,
        };
        let session = &self.session;
        let canvas = session.canvas();
        let phase = session.phase();
        let stroke = session.stroke().snapshot();

        TickReport {
            sequence: self.sequence,
            frame_size: self.frame_size,
            scanned_size: self.scanned_size,
            detection: self.detection,
            camera_point,
            phase,
            anchors: *session.anchors(),
            transform: session.transform().map(|t| t.to_array()),
            guidance_marker: phase.corner().map(|c| c.guidance_marker(canvas, MARKER_INSET)),
            rejected: session.rejected(),
            canvas,
            stroke_len: stroke.len(),
            stroke,
        }
    }
}

/// JPEG-encoded intermediate images
#[derive(Debug, Clone, Default)]
pub struct Previews {
    pub gray: Vec<u8>,
    pub threshold: Vec<u8>,
    pub shrunk: Vec<u8>,
    pub rectified: Vec<u8>,
}

/// Encode the intermediate bitmaps of one tick
fn encode_previews(
    pre: &Preprocessed,
    tracker: &Tracker,
    config: &PreviewConfig,
) -> Result<Previews> {
    let q = config.quality;
    let mut shrunk = frame_to_image(&pre.shrunk)?;
    if let Some(p) = tracker.detection.point {
        draw_hollow_circle_mut(
            &mut shrunk,
            (p.x.round() as i32, p.y.round() as i32),
            4,
            image::Rgb([255, 0, 0]),
        );
    }
    let anchors = tracker.session().anchors();
    for corner in Corner::ALL {
        if let Some(a) = anchors.get(corner) {
            let p = map_point(a, pre.gray.size(), pre.shrunk.size());
            draw_hollow_circle_mut(
                &mut shrunk,
                (p.x.round() as i32, p.y.round() as i32),
                2,
                image::Rgb([0, 255, 0]),
            );
        }
    }

    let rectified = match tracker.session().transform() {
        Some(t) if config.rectified => encode_jpeg(&frame_to_image(&t.warp_rgb(&pre.gray)?)?, q)?,
        _ => Vec::new(),
    };

    Ok(Previews {
        gray: encode_jpeg(&frame_to_image(&pre.gray)?, q)?,
        threshold: encode_jpeg(&frame_to_image(&pre.binary)?, q)?,
        shrunk: encode_jpeg(&shrunk, q)?,
        rectified,
    })
}

fn frame_to_image(frame: &Frame) -> Result<image::RgbImage> {
    image::RgbImage::from_raw(frame.width(), frame.height(), frame.to_packed_rgb()?)
        .ok_or_else(|| anyhow::anyhow!("Failed to create image buffer"))
}

/// Encode RGB data to JPEG
fn encode_jpeg(img: &image::RgbImage, quality: u8) -> Result<Vec<u8>> {
    use image::ImageOutputFormat;
    use std::io::Cursor;

    let mut jpeg_data = Vec::new();
    let mut cursor = Cursor::new(&mut jpeg_data);
    img.write_to(&mut cursor, ImageOutputFormat::Jpeg(quality))?;

    Ok(jpeg_data)
}

/// Drive the tracker at `tracking.tick_hz` until shutdown or a fatal error
pub fn run_processing(
    config: &Config,
    slot: Arc<FrameSlot>,
    mut commands: UnboundedReceiver<Command>,
    state: Arc<AppState>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let period = Duration::from_secs_f64(1.0 / config.tracking.tick_hz as f64);
    info!(
        "Processing at {} Hz (threshold {}, window {}, scale {})",
        config.tracking.tick_hz,
        config.tracking.threshold,
        config.tracking.window_size,
        config.tracking.scale_factor
    );

    let mut tracker = Tracker::new(config);
    let mut last_sequence = 0u64;
    let mut ticks = 0u64;

    // Performance tracking
    let mut processed = 0u64;
    let mut dropped = 0u64;
    let mut busy = Duration::ZERO;
    let mut last_stats_time = Instant::now();
    let stats_interval = Duration::from_secs(10);
    let mut next_tick = Instant::now();

    state.publish_report(tracker.report());

    while !shutdown.load(Ordering::Relaxed) {
        let mut changed = false;
        while let Ok(command) = commands.try_recv() {
            tracker.apply(command);
            changed = true;
        }

        if let Some(snapshot) = slot.snapshot().filter(|s| s.sequence != last_sequence) {
            let started = Instant::now();
            if last_sequence != 0 {
                dropped += snapshot.sequence - last_sequence - 1;
            }
            last_sequence = snapshot.sequence;

            let (pre, event) = tracker
                .process(&snapshot.frame, snapshot.sequence)
                .context("Frame rejected by preprocessing")?;
            match &event {
                SessionEvent::CornerAcquired { corner, point } => debug!(
                    "Tick {}: {} at ({:.1}, {:.1})",
                    ticks,
                    corner.label(),
                    point.x,
                    point.y
                ),
                SessionEvent::StrokeExtended(p) => {
                    debug!("Tick {}: stroke to ({:.1}, {:.1})", ticks, p.x, p.y)
                }
                SessionEvent::CalibrationRejected(e) => debug!("Tick {}: {}", ticks, e),
                SessionEvent::Calibrated | SessionEvent::Nothing => {}
            }

            let preview = &config.preview;
            if preview.enabled
                && processed % preview.every_n_ticks.max(1) as u64 == 0
                && state.should_encode_preview()
            {
                match encode_previews(&pre, &tracker, preview) {
                    Ok(previews) => state.update_previews(previews),
                    Err(e) => warn!("Failed to encode previews: {}", e),
                }
            }

            processed += 1;
            busy += started.elapsed();
            changed = true;
        }

        if changed {
            state.publish_report(tracker.report());
        }
        ticks += 1;

        if last_stats_time.elapsed() >= stats_interval {
            let elapsed = last_stats_time.elapsed().as_secs_f64();
            let mean_ms = if processed > 0 {
                busy.as_secs_f64() * 1000.0 / processed as f64
            } else {
                0.0
            };
            info!(
                "Performance: {} frames in {:.1}s ({:.1} fps), {} dropped, {:.2} ms/frame, captured {} total",
                processed,
                elapsed,
                processed as f64 / elapsed,
                dropped,
                mean_ms,
                slot.published()
            );
            processed = 0;
            dropped = 0;
            busy = Duration::ZERO;
            last_stats_time = Instant::now();
        }

        // Fixed-rate schedule; if we fell behind, start over from now
        next_tick += period;
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        } else {
            next_tick = now;
        }
    }

    info!("Processing loop stopped");
    Ok(())
}
