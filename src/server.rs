//! Web server: render-sink API, command endpoints and the drawing page

use anyhow::Result;
use arc_swap::ArcSwap;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use parking_lot::RwLock;
use rust_embed::RustEmbed;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::coords::{Point2D, Size};
use crate::pipeline::{Previews, TickReport};
use crate::session::Command;

/// Previews keep being encoded this long after the last request
const PREVIEW_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Embedded static files for the web UI
#[derive(RustEmbed)]
#[folder = "static/"]
struct StaticAssets;

/// Which intermediate image a preview request wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewStage {
    Gray,
    Threshold,
    Shrunk,
    Rectified,
}

impl PreviewStage {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "gray" => Some(PreviewStage::Gray),
            "threshold" => Some(PreviewStage::Threshold),
            "shrunk" => Some(PreviewStage::Shrunk),
            "rectified" => Some(PreviewStage::Rectified),
            _ => None,
        }
    }
}

/// Shared application state
pub struct AppState {
    /// Configuration the session was started with
    pub config: Config,
    /// Latest tick report, swapped in by the processing thread
    report: ArcSwap<TickReport>,
    /// Latest previews (JPEG encoded)
    previews: RwLock<Previews>,
    /// Commands for the processing thread
    commands: UnboundedSender<Command>,
    started: Instant,
    /// Milliseconds after `started` of the last preview request, plus one (0 = never)
    preview_requested: AtomicU64,
}

impl AppState {
    pub fn new(config: Config, commands: UnboundedSender<Command>) -> Self {
        let canvas = config.canvas.size();
        Self {
            config,
            report: ArcSwap::from_pointee(TickReport::initial(canvas)),
            previews: RwLock::new(Previews::default()),
            commands,
            started: Instant::now(),
            preview_requested: AtomicU64::new(0),
        }
    }

    /// Queue a command; fails once the processing loop has gone away
    pub fn send_command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow::anyhow!("Processing loop is not running"))
    }

    pub fn publish_report(&self, report: TickReport) {
        self.report.store(Arc::new(report));
    }

    pub fn report(&self) -> Arc<TickReport> {
        self.report.load_full()
    }

    /// Update the previews (called from the processing thread)
    pub fn update_previews(&self, previews: Previews) {
        *self.previews.write() = previews;
    }

    pub fn preview(&self, stage: PreviewStage) -> Vec<u8> {
        self.mark_preview_requested();
        let previews = self.previews.read();
        match stage {
            PreviewStage::Gray => previews.gray.clone(),
            PreviewStage::Threshold => previews.threshold.clone(),
            PreviewStage::Shrunk => previews.shrunk.clone(),
            PreviewStage::Rectified => previews.rectified.clone(),
        }
    }

    fn mark_preview_requested(&self) {
        let now = self.started.elapsed().as_millis() as u64 + 1;
        self.preview_requested.store(now, Ordering::Relaxed);
    }

    /// Whether anyone has asked for a preview recently
    pub fn should_encode_preview(&self) -> bool {
        let last = self.preview_requested.load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        let now = self.started.elapsed().as_millis() as u64 + 1;
        now.saturating_sub(last) <= PREVIEW_IDLE_TIMEOUT.as_millis() as u64
    }
}

/// Run the web server
pub async fn run_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        // Static files and UI
        .route("/", get(index_handler))
        .route("/static/*path", get(static_handler))
        // Render sink
        .route("/api/state", get(get_state))
        .route("/api/stroke", get(get_stroke))
        // Commands
        .route("/api/calibration/begin", post(begin_calibration))
        .route("/api/strokes/clear", post(clear_strokes))
        // Preview images
        .route("/api/preview/:stage", get(get_preview))
        .route("/api/preview/:stage/stream", get(preview_stream))
        // System info
        .route("/api/info", get(get_info))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Web server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Serve the main index page
async fn index_handler() -> impl IntoResponse {
    match StaticAssets::get("index.html") {
        Some(content) => Html(content.data.to_vec()).into_response(),
        None => (StatusCode::NOT_FOUND, "Index not found").into_response(),
    }
}

/// Serve static files
async fn static_handler(Path(path): Path<String>) -> impl IntoResponse {
    let path = path.trim_start_matches('/');

    match StaticAssets::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            (
                [(axum::http::header::CONTENT_TYPE, mime.as_ref())],
                content.data.to_vec(),
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

/// Latest tick report
async fn get_state(State(state): State<Arc<AppState>>) -> Json<TickReport> {
    Json(state.report().as_ref().clone())
}

/// Incremental stroke fetch: the client sends what it already has
#[derive(Debug, Default, Deserialize)]
struct StrokeQuery {
    #[serde(default)]
    since: usize,
    generation: Option<u64>,
}

#[derive(Debug, Serialize)]
struct StrokeResponse {
    canvas: Size,
    generation: u64,
    /// Index of the first point in `points`
    since: usize,
    total: usize,
    points: Vec<Point2D>,
}

/// Points the client is missing; a cleared stroke restarts from zero
fn stroke_page(report: &TickReport, query: &StrokeQuery) -> StrokeResponse {
    let stroke = &report.stroke;
    let since = match query.generation {
        Some(g) if g == stroke.generation() && query.since <= stroke.len() => query.since,
        _ => 0,
    };
    StrokeResponse {
        canvas: report.canvas,
        generation: stroke.generation(),
        since,
        total: stroke.len(),
        points: stroke.since(since).copied().collect(),
    }
}

/// Current stroke in canvas coordinates
async fn get_stroke(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StrokeQuery>,
) -> Json<StrokeResponse> {
    Json(stroke_page(&state.report(), &query))
}

async fn begin_calibration(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    send(&state, Command::BeginCalibration)
}

async fn clear_strokes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    send(&state, Command::ClearStrokes)
}

fn send(state: &AppState, command: Command) -> axum::response::Response {
    match state.send_command(command) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// Get the current preview for one stage (JPEG)
async fn get_preview(
    State(state): State<Arc<AppState>>,
    Path(stage): Path<String>,
) -> impl IntoResponse {
    let Some(stage) = PreviewStage::parse(&stage) else {
        return (StatusCode::NOT_FOUND, "Unknown preview stage").into_response();
    };

    let frame = state.preview(stage);
    if frame.is_empty() {
        return (StatusCode::SERVICE_UNAVAILABLE, "No frame available").into_response();
    }

    (
        [(axum::http::header::CONTENT_TYPE, "image/jpeg")],
        frame,
    )
        .into_response()
}

/// MJPEG stream endpoint for continuous preview
async fn preview_stream(
    State(state): State<Arc<AppState>>,
    Path(stage): Path<String>,
) -> impl IntoResponse {
    use axum::body::Body;
    use tokio_stream::StreamExt;

    let Some(stage) = PreviewStage::parse(&stage) else {
        return (StatusCode::NOT_FOUND, "Unknown preview stage").into_response();
    };

    let stream = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(
        Duration::from_millis(100), // ~10 fps for preview
    ))
    .map(move |_| {
        let frame = state.preview(stage);
        if frame.is_empty() {
            return Ok::<_, std::convert::Infallible>(
                "--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_string().into_bytes(),
            );
        }

        let mut response = Vec::new();
        response.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ");
        response.extend_from_slice(frame.len().to_string().as_bytes());
        response.extend_from_slice(b"\r\n\r\n");
        response.extend_from_slice(&frame);
        response.extend_from_slice(b"\r\n");

        Ok(response)
    });

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )],
        Body::from_stream(stream),
    )
        .into_response()
}

/// System information response
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    input_device: String,
    width: u32,
    height: u32,
    canvas: Size,
    tick_hz: u32,
    previews_enabled: bool,
}

/// Get system information
async fn get_info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    let config = &state.config;

    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        input_device: config.video.input_device.clone(),
        width: config.video.width,
        height: config.video.height,
        canvas: config.canvas.size(),
        tick_hz: config.tracking.tick_hz,
        previews_enabled: config.preview.enabled,
    })
}
