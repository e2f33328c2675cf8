pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;
#[cfg(feature = "v4l2")]
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use capture::session::{
    DEFAULT_BANDWIDTH, DEFAULT_PREVIEW_FPS_MAX, DEFAULT_PREVIEW_FPS_MIN, DEFAULT_PREVIEW_HEIGHT,
    DEFAULT_PREVIEW_WIDTH,
};
use capture::{PreviewRequest, StreamMode};
use pipeline::{OutputFormat, FRAME_POOL_SIZE, MAX_FRAME};

pub use error::{PreviewError, Result};
pub use pipeline::{PreviewEngine, PreviewState};

/// Active configuration, swappable at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment variable prefix, e.g. `UVC_PREVIEW__CAPTURE__WIDTH=1280`
pub const ENV_PREFIX: &str = "UVC_PREVIEW";

/// System configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Device path; empty means auto-detect
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub min_fps: u32,
    pub max_fps: u32,
    pub mode: StreamMode,
    pub bandwidth: f32,
    /// Kernel-side buffers for memory-mapped streaming
    pub buffer_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    /// Frames buffered between the consumer thread and the window
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub frame_pool_size: usize,
    pub max_queued_frames: usize,
    pub output_format: OutputFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                device: String::new(),
                width: DEFAULT_PREVIEW_WIDTH,
                height: DEFAULT_PREVIEW_HEIGHT,
                min_fps: DEFAULT_PREVIEW_FPS_MIN,
                max_fps: DEFAULT_PREVIEW_FPS_MAX,
                mode: StreamMode::Raw,
                bandwidth: DEFAULT_BANDWIDTH,
                buffer_count: 4,
            },
            display: DisplayConfig {
                width: DEFAULT_PREVIEW_WIDTH,
                height: DEFAULT_PREVIEW_HEIGHT,
                channel_capacity: 2,
            },
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_pool_size: FRAME_POOL_SIZE,
            max_queued_frames: MAX_FRAME,
            output_format: OutputFormat::Rgbx,
        }
    }
}

impl Config {
    /// Layer defaults, an optional config file and `UVC_PREVIEW__*` variables.
    pub fn load(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

impl CaptureConfig {
    pub fn preview_request(&self) -> PreviewRequest {
        PreviewRequest {
            width: self.width,
            height: self.height,
            min_fps: self.min_fps,
            max_fps: self.max_fps,
            mode: self.mode,
            bandwidth: self.bandwidth,
        }
    }
}
