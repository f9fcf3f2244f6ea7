//! Configuration management for LaserDraw

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::coords::Size;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("tracking.window_size must be at least 1")]
    ZeroWindow,
    #[error("tracking.scale_factor must be a positive number, got {0}")]
    BadScale(f64),
    #[error("tracking.tick_hz must be at least 1")]
    ZeroTickRate,
    #[error("canvas dimensions must be non-zero, got {0}x{1}")]
    EmptyCanvas(u32, u32),
    #[error("video dimensions must be non-zero, got {0}x{1}")]
    EmptyVideo(u32, u32),
    #[error("preview.quality must be within 1..=100, got {0}")]
    BadQuality(u8),
}

/// Preferred capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    /// Prefer MJPEG (lower USB bandwidth, higher frame rates)
    #[default]
    Mjpeg,
    /// Prefer YUYV (uncompressed, no decode cost)
    Yuyv,
}

/// Video configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    pub input_device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Preferred capture format (MJPEG or YUYV)
    #[serde(default)]
    pub format: CaptureFormat,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            input_device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            format: CaptureFormat::default(),
        }
    }
}

/// Detection and processing loop parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Processing ticks per second
    pub tick_hz: u32,
    /// Binarization cutoff applied after grayscale
    pub threshold: u8,
    /// Per-pixel cutoff used when scoring blocks
    pub brightness_threshold: u8,
    /// Side of the square scan block, in shrunk-image pixels
    pub window_size: u32,
    /// Shrink factor applied before the block scan
    pub scale_factor: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            tick_hz: 30,
            threshold: 100,
            brightness_threshold: 100,
            window_size: 2,
            scale_factor: 0.4,
        }
    }
}

/// Canonical drawing surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        // 16:9 band of a 1024 pixel wide surface
        Self {
            width: 1024,
            height: 576,
        }
    }
}

impl CanvasConfig {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8092,
        }
    }
}

/// Intermediate bitmap previews for the web UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub enabled: bool,
    /// JPEG quality (1-100)
    pub quality: u8,
    /// Encode previews on every n-th processed tick
    pub every_n_ticks: u32,
    /// Also render the perspective-corrected frame once calibrated
    pub rectified: bool,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            quality: 70,
            every_n_ticks: 3,
            rectified: true,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub video: VideoConfig,

    #[serde(default)]
    pub tracking: TrackingConfig,

    #[serde(default)]
    pub canvas: CanvasConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub preview: PreviewConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config = Self::from_toml(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            config
        };

        config
            .validate()
            .with_context(|| format!("Invalid configuration in {:?}", path))?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory {:?}", parent))?;
            }
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.tracking;
        if t.window_size == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if !t.scale_factor.is_finite() || t.scale_factor <= 0.0 {
            return Err(ConfigError::BadScale(t.scale_factor));
        }
        if t.tick_hz == 0 {
            return Err(ConfigError::ZeroTickRate);
        }
        if self.canvas.width == 0 || self.canvas.height == 0 {
            return Err(ConfigError::EmptyCanvas(self.canvas.width, self.canvas.height));
        }
        if self.video.width == 0 || self.video.height == 0 {
            return Err(ConfigError::EmptyVideo(self.video.width, self.video.height));
        }
        if !(1..=100).contains(&self.preview.quality) {
            return Err(ConfigError::BadQuality(self.preview.quality));
        }
        Ok(())
    }
}
