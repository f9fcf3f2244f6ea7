//! LaserDraw - draw on a wall with a laser pointer
//!
//! This application captures video from a USB camera, finds the laser dot in
//! every frame, calibrates a perspective mapping from four pointed-at corners
//! and accumulates the dot's path into a stroke on a canonical canvas that a
//! browser can render.

mod calibration;
mod capture;
mod config;
mod coords;
mod frame;
mod locator;
mod pipeline;
mod preprocess;
mod server;
mod session;
mod stroke;
mod transform;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::frame::FrameSlot;

/// LaserDraw - laser pointer drawing over a calibrated camera view
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Input video device, overrides the config file (e.g., /dev/video0)
    #[arg(short, long)]
    input: Option<String>,

    /// Capture width, overrides the config file
    #[arg(long)]
    width: Option<u32>,

    /// Capture height, overrides the config file
    #[arg(long)]
    height: Option<u32>,

    /// Web server port, overrides the config file
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("LaserDraw v{}", env!("CARGO_PKG_VERSION"));

    // Load or create configuration, CLI args win over the file
    let mut config = config::Config::load_or_create(&args.config)?;
    if let Some(input) = args.input {
        config.video.input_device = input;
    }
    if let Some(width) = args.width {
        config.video.width = width;
    }
    if let Some(height) = args.height {
        config.video.height = height;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    info!("Input device: {}", config.video.input_device);
    info!(
        "Resolution: {}x{} @ {}fps",
        config.video.width, config.video.height, config.video.fps
    );
    info!("Canvas: {}x{}", config.canvas.width, config.canvas.height);

    let slot = Arc::new(FrameSlot::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    let (command_tx, command_rx) = tokio::sync::mpsc::unbounded_channel();
    let state = Arc::new(server::AppState::new(config.clone(), command_tx));

    // Capture actor: owns the camera, only ever swaps frames into the slot
    let capture_handle = {
        let video = config.video.clone();
        let slot = slot.clone();
        let shutdown = shutdown.clone();
        tokio::task::spawn_blocking(move || capture::run_capture(&video, slot, shutdown))
    };

    // Processing tick: owns the tracking session
    let processing_handle = {
        let config = config.clone();
        let slot = slot.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::task::spawn_blocking(move || {
            pipeline::run_processing(&config, slot, command_rx, state, shutdown)
        })
    };

    // Start the web server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting web server at http://{}", addr);

    let server_state = state.clone();
    let server_handle = tokio::spawn(async move {
        server::run_server(&addr, server_state).await
    });

    // Whichever finishes first ends the session
    let outcome = tokio::select! {
        result = capture_handle => match result {
            Ok(Ok(())) => { info!("Capture exited normally"); Ok(()) }
            Ok(Err(e)) => Err(e.context("Capture failed")),
            Err(e) => Err(anyhow::anyhow!("Capture task panicked: {}", e)),
        },
        result = processing_handle => match result {
            Ok(Ok(())) => { info!("Processing exited normally"); Ok(()) }
            Ok(Err(e)) => Err(e.context("Processing failed")),
            Err(e) => Err(anyhow::anyhow!("Processing task panicked: {}", e)),
        },
        result = server_handle => match result {
            Ok(Ok(())) => { info!("Server exited normally"); Ok(()) }
            Ok(Err(e)) => Err(e.context("Server failed")),
            Err(e) => Err(anyhow::anyhow!("Server task panicked: {}", e)),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    };

    shutdown.store(true, Ordering::Relaxed);

    if let Err(e) = &outcome {
        tracing::error!("{:#}", e);
    }
    outcome
}
