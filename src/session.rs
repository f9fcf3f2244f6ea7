//! Per-session tracking state: calibration phase, anchors, transform, stroke
//!
//! One [`TrackingSession`] is owned by the processing loop. Commands and
//! detections are fed into it on that thread only, so none of this state is
//! shared.

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::calibration::{AnchorSet, CalibrationError, CalibrationPhase, Corner};
use crate::coords::{map_point, Point2D, Size};
use crate::locator::Detection;
use crate::stroke::Stroke;
use crate::transform::PerspectiveTransform;

/// Commands accepted from the input layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    BeginCalibration,
    ClearStrokes,
}

/// What a single observed frame did to the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Nothing,
    CornerAcquired { corner: Corner, point: Point2D },
    Calibrated,
    CalibrationRejected(CalibrationError),
    StrokeExtended(Point2D),
}

#[derive(Debug, Clone)]
pub struct TrackingSession {
    phase: CalibrationPhase,
    anchors: AnchorSet,
    transform: Option<PerspectiveTransform>,
    /// Presence on the previous observed frame, `None` before the first one
    last_visible: Option<bool>,
    /// Set when the last attempt to finish calibration failed; edges are
    /// ignored until calibration is restarted
    rejected: Option<CalibrationError>,
    stroke: Stroke,
    canvas: Size,
}

impl TrackingSession {
    pub fn new(canvas: Size) -> Self {
        Self {
            phase: CalibrationPhase::Idle,
            anchors: AnchorSet::new(),
            transform: None,
            last_visible: None,
            rejected: None,
            stroke: Stroke::new(),
            canvas,
        }
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    pub fn anchors(&self) -> &AnchorSet {
        &self.anchors
    }

    pub fn transform(&self) -> Option<&PerspectiveTransform> {
        self.transform.as_ref()
    }

    pub fn rejected(&self) -> Option<CalibrationError> {
        self.rejected
    }

    pub fn stroke(&self) -> &Stroke {
        &self.stroke
    }

    pub fn canvas(&self) -> Size {
        self.canvas
    }

    pub fn apply(&mut self, command: Command) {
        match command {
            Command::BeginCalibration => self.begin_calibration(),
            Command::ClearStrokes => self.clear_strokes(),
        }
    }

    /// Restart anchor acquisition from the top-left corner
    pub fn begin_calibration(&mut self) {
        self.phase = CalibrationPhase::AcquiringCorner(Corner::TopLeft);
        self.anchors.clear();
        self.transform = None;
        self.rejected = None;
        info!("Calibration started: point at {}", Corner::TopLeft.label());
    }

    pub fn clear_strokes(&mut self) {
        if self.stroke.is_empty() {
            return;
        }
        let dropped = self.stroke.len();
        self.stroke.clear();
        info!("Cleared stroke ({} points)", dropped);
    }

    /// Feed one frame's detection
    ///
    /// `scanned` is the size of the image the detector ran on, `camera` the
    /// size of the captured frame it was derived from.
    pub fn observe(&mut self, detection: &Detection, scanned: Size, camera: Size) -> SessionEvent {
        let rising = detection.is_present() && self.last_visible == Some(false);
        self.last_visible = Some(detection.is_present());

        let Some(point) = detection.point.map(|p| map_point(p, scanned, camera)) else {
            return SessionEvent::Nothing;
        };

        match self.phase {
            CalibrationPhase::Idle => SessionEvent::Nothing,
            CalibrationPhase::AcquiringCorner(corner) => {
                if !rising || self.rejected.is_some() {
                    return SessionEvent::Nothing;
                }
                self.acquire(corner, point, camera)
            }
            CalibrationPhase::Calibrated => self.draw(point),
        }
    }

    fn acquire(&mut self, corner: Corner, point: Point2D, camera: Size) -> SessionEvent {
        let Some(next) = Corner::from_index(corner.index() + 1) else {
            return self.finish(point, camera);
        };

        if let Err(e) = self.anchors.set(corner, point) {
            error!("Anchor bookkeeping out of step: {}", e);
            return SessionEvent::Nothing;
        }
        self.phase = CalibrationPhase::AcquiringCorner(next);
        info!(
            "{} anchored at ({:.1}, {:.1}); next: {}",
            corner.label(),
            point.x,
            point.y,
            next.label()
        );
        SessionEvent::CornerAcquired { corner, point }
    }

    /// Last corner seen: build the transform, or stay put if it is degenerate
    fn finish(&mut self, point: Point2D, camera: Size) -> SessionEvent {
        let candidate = self.anchors.with_next(point);
        let built = candidate
            .complete()
            .and_then(|anchors| PerspectiveTransform::from_anchors(anchors, camera));

        match built {
            Ok(transform) => {
                self.anchors = candidate;
                self.transform = Some(transform);
                self.phase = CalibrationPhase::Calibrated;
                info!(
                    "{} anchored at ({:.1}, {:.1}); calibrated",
                    Corner::BottomLeft.label(),
                    point.x,
                    point.y
                );
                SessionEvent::Calibrated
            }
            Err(e) => {
                warn!("Rejected calibration: {}; restart calibration to retry", e);
                self.rejected = Some(e);
                SessionEvent::CalibrationRejected(e)
            }
        }
    }

    fn draw(&mut self, point: Point2D) -> SessionEvent {
        let Some(transform) = self.transform.as_ref() else {
            error!("Calibrated without a transform");
            return SessionEvent::Nothing;
        };
        let Some(canonical) = transform.apply(point) else {
            debug!("Point ({:.1}, {:.1}) maps to infinity", point.x, point.y);
            return SessionEvent::Nothing;
        };

        let mapped = map_point(canonical, transform.target(), self.canvas);
        self.stroke.append(mapped);
        SessionEvent::StrokeExtended(mapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCANNED: Size = Size {
        width: 256,
        height: 192,
    };
    const CAMERA: Size = Size {
        width: 640,
        height: 480,
    };
    const CANVAS: Size = Size {
        width: 1024,
        height: 576,
    };

    /// Shrunk-space anchors of the camera rectangle (64,48)-(576,432)
    const ANCHORS: [(f64, f64); 4] = [(25.6, 19.2), (230.4, 19.2), (230.4, 172.8), (25.6, 172.8)];

    fn seen(x: f64, y: f64) -> Detection {
        Detection {
            point: Some(Point2D::new(x, y)),
            score: 4,
        }
    }

    fn step(session: &mut TrackingSession, det: Detection) -> SessionEvent {
        session.observe(&det, SCANNED, CAMERA)
    }

    fn calibrated() -> TrackingSession {
        let mut session = TrackingSession::new(CANVAS);
        session.begin_calibration();
        for (x, y) in ANCHORS {
            step(&mut session, Detection::none());
            step(&mut session, seen(x, y));
        }
        assert_eq!(session.phase(), CalibrationPhase::Calibrated);
        session
    }

    fn assert_close(a: Point2D, b: Point2D) {
        assert!(
            (a.x - b.x).abs() < 1e-3 && (a.y - b.y).abs() < 1e-3,
            "{:?} != {:?}",
            a,
            b
        );
    }

    #[test]
    fn test_alternating_presence_calibrates() {
        let mut session = TrackingSession::new(CANVAS);
        session.begin_calibration();

        let mut events = Vec::new();
        for (x, y) in ANCHORS {
            events.push(step(&mut session, Detection::none()));
            events.push(step(&mut session, seen(x, y)));
        }

        let acquired = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::CornerAcquired { .. }))
            .count();
        assert_eq!(acquired, 3);
        assert_eq!(events.last(), Some(&SessionEvent::Calibrated));
        assert_eq!(session.phase(), CalibrationPhase::Calibrated);
        assert!(session.transform().is_some());

        let tl = session.anchors().get(Corner::TopLeft).unwrap();
        assert_close(tl, Point2D::new(64.0, 48.0));
    }

    #[test]
    fn test_sustained_presence_does_not_advance() {
        let mut session = TrackingSession::new(CANVAS);
        session.begin_calibration();
        // First frame ever seen: there is no earlier absence to rise from
        for _ in 0..3 {
            assert_eq!(step(&mut session, seen(10.0, 10.0)), SessionEvent::Nothing);
        }
        assert_eq!(
            session.phase(),
            CalibrationPhase::AcquiringCorner(Corner::TopLeft)
        );
        assert_eq!(session.anchors().filled(), 0);

        // Dropping out and coming back is a rising edge
        step(&mut session, Detection::none());
        assert!(matches!(
            step(&mut session, seen(10.0, 10.0)),
            SessionEvent::CornerAcquired {
                corner: Corner::TopLeft,
                ..
            }
        ));

        let mut session = TrackingSession::new(CANVAS);
        step(&mut session, seen(10.0, 10.0));
        session.begin_calibration();
        for _ in 0..3 {
            assert_eq!(step(&mut session, seen(10.0, 10.0)), SessionEvent::Nothing);
        }
        assert_eq!(
            session.phase(),
            CalibrationPhase::AcquiringCorner(Corner::TopLeft)
        );
        assert_eq!(session.anchors().filled(), 0);
    }

    #[test]
    fn test_falling_edge_does_not_advance() {
        let mut session = TrackingSession::new(CANVAS);
        session.begin_calibration();
        step(&mut session, Detection::none());
        step(&mut session, seen(10.0, 10.0));
        step(&mut session, Detection::none());
        step(&mut session, Detection::none());
        assert_eq!(session.anchors().filled(), 1);
        assert_eq!(
            session.phase(),
            CalibrationPhase::AcquiringCorner(Corner::TopRight)
        );
    }

    #[test]
    fn test_idle_ignores_detections() {
        let mut session = TrackingSession::new(CANVAS);
        for _ in 0..4 {
            step(&mut session, Detection::none());
            step(&mut session, seen(50.0, 50.0));
        }
        assert_eq!(session.phase(), CalibrationPhase::Idle);
        assert!(session.stroke().is_empty());
    }

    #[test]
    fn test_calibrated_detection_extends_stroke() {
        let mut session = calibrated();

        // Center of the shrunk image is the center of the anchor rectangle
        let event = step(&mut session, seen(128.0, 96.0));
        let SessionEvent::StrokeExtended(p) = &event else {
            panic!("expected a stroke point, got {:?}", event);
        };
        assert_close(*p, Point2D::new(512.0, 288.0));

        // Top-left anchor lands on the canvas origin
        step(&mut session, seen(25.6, 19.2));
        assert_close(*session.stroke().snapshot().since(0).last().unwrap(), Point2D::new(0.0, 0.0));

        assert_eq!(step(&mut session, Detection::none()), SessionEvent::Nothing);
        assert_eq!(session.stroke().len(), 2);
    }

    #[test]
    fn test_clear_strokes_keeps_calibration() {
        let mut session = calibrated();
        step(&mut session, seen(100.0, 100.0));
        step(&mut session, seen(101.0, 100.0));
        assert_eq!(session.stroke().len(), 2);

        let anchors = *session.anchors();
        let transform = session.transform().cloned();

        session.apply(Command::ClearStrokes);

        assert!(session.stroke().is_empty());
        assert_eq!(session.phase(), CalibrationPhase::Calibrated);
        assert_eq!(*session.anchors(), anchors);
        assert_eq!(session.transform().cloned(), transform);
    }

    #[test]
    fn test_recalibration_resets_but_keeps_stroke() {
        let mut session = calibrated();
        step(&mut session, seen(100.0, 100.0));

        session.apply(Command::BeginCalibration);

        assert_eq!(
            session.phase(),
            CalibrationPhase::AcquiringCorner(Corner::TopLeft)
        );
        assert!(session.transform().is_none());
        assert_eq!(session.anchors().filled(), 0);
        assert_eq!(session.stroke().len(), 1);

        // Laser still on: drawing stops, no anchor is taken without an edge
        step(&mut session, seen(100.0, 100.0));
        assert_eq!(session.stroke().len(), 1);
        assert_eq!(session.anchors().filled(), 0);
    }

    #[test]
    fn test_new_calibration_builds_fresh_transform() {
        let mut session = calibrated();
        let first = session.transform().cloned().unwrap();

        session.begin_calibration();
        let shifted = [(30.0, 20.0), (220.0, 25.0), (225.0, 170.0), (28.0, 165.0)];
        for (x, y) in shifted {
            step(&mut session, Detection::none());
            step(&mut session, seen(x, y));
        }

        let second = session.transform().unwrap();
        assert_ne!(&first, second);
        let tl = map_point(Point2D::new(30.0, 20.0), SCANNED, CAMERA);
        assert_close(second.apply(tl).unwrap(), Point2D::new(0.0, 0.0));
    }

    #[test]
    fn test_degenerate_calibration_stays_on_last_corner() {
        let mut session = TrackingSession::new(CANVAS);
        session.begin_calibration();
        let mut last = SessionEvent::Nothing;
        for (x, y) in [(10.0, 10.0), (20.0, 20.0), (30.0, 30.0), (40.0, 40.0)] {
            step(&mut session, Detection::none());
            last = step(&mut session, seen(x, y));
        }

        assert!(matches!(
            last,
            SessionEvent::CalibrationRejected(CalibrationError::Degenerate(_))
        ));
        assert_eq!(
            session.phase(),
            CalibrationPhase::AcquiringCorner(Corner::BottomLeft)
        );
        assert!(session.transform().is_none());
        assert_eq!(session.anchors().filled(), 3);

        // Further edges are ignored until calibration restarts
        step(&mut session, Detection::none());
        assert_eq!(step(&mut session, seen(25.6, 172.8)), SessionEvent::Nothing);
        assert!(session.rejected().is_some());

        session.begin_calibration();
        assert!(session.rejected().is_none());
    }
}
