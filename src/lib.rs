pub mod capture;
pub mod error;
pub mod notify;
pub mod pipeline;
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use capture::StreamConfig;
use pipeline::{BufferStats, FilterKind, LoopState, RateConfig};
use serde::{Deserialize, Serialize};

pub use capture::Frame;
pub use error::{PipelineError, Result};
pub use pipeline::Pipeline;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub rate: RateConfig,
    /// Filters applied to every frame, first entry innermost
    pub filters: Vec<FilterKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Synthetic,
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: BackendKind,
    pub stream: StreamConfig,
    /// Wire format requested from V4L2 devices
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// V4L2 only: how long a grab waits before reporting no frame
    pub grab_timeout_ms: u64,
    pub synthetic_devices: u32,
    pub synthetic_fps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frame slots between capture and consumer; 1 keeps only the latest
    pub buffer_capacity: usize,
    /// How often a waiting consumer re-checks its stop flag
    pub poll_interval_ms: u64,
    pub log_dropped_grabs: bool,
    pub capture_core: Option<usize>,
    pub throttle: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Synthetic,
            stream: StreamConfig::default(),
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            grab_timeout_ms: 200,
            synthetic_devices: 2,
            synthetic_fps: 30.0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 2,
            poll_interval_ms: 10,
            log_dropped_grabs: false,
            capture_core: None,
            throttle: true,
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `FRAMEPIPE__*` environment
    /// variables, in that order.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix("FRAMEPIPE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
            .map_err(PipelineError::from)
    }

    pub fn from_toml(source: &str) -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
            .map_err(PipelineError::from)
    }
}

/// Snapshot of pipeline counters
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStats {
    pub buffer: BufferStats,
    pub frames_grabbed: u64,
    pub empty_grabs: u64,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub capture_state: LoopState,
    pub consumer_state: LoopState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use capture::DeviceId;

    #[test]
    fn empty_config_is_default() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.capture.backend, BackendKind::Synthetic);
        assert_eq!(config.capture.stream, StreamConfig::default());
        assert_eq!(config.pipeline.buffer_capacity, 2);
        assert_eq!(config.capture.grab_timeout_ms, 200);
        assert!(config.filters.is_empty());
    }

    #[test]
    fn parses_stream_and_filters() {
        let config = Config::from_toml(
            r#"
            [capture]
            backend = "v4l2"
            format = "Yuyv4"
            grab_timeout_ms = 80

            [capture.stream]
            device = "/dev/video2"
            width = 1280
            height = 720
            desired_fps = 24

            [pipeline]
            buffer_capacity = 1
            log_dropped_grabs = true

            [rate]
            ceiling_fps = 15

            [[filters]]
            kind = "grayscale"

            [[filters]]
            kind = "gaussian_blur"
            sigma = 1.5
            "#,
        )
        .unwrap();

        assert_eq!(config.capture.backend, BackendKind::V4l2);
        assert_eq!(config.capture.format, PixelFormat::Yuyv4);
        assert_eq!(config.capture.grab_timeout_ms, 80);
        assert_eq!(
            config.capture.stream,
            StreamConfig::new(DeviceId::from("/dev/video2"), 1280, 720, 24)
        );
        assert_eq!(config.pipeline.buffer_capacity, 1);
        assert!(config.pipeline.log_dropped_grabs);
        assert_eq!(config.rate.ceiling_fps, Some(15));
        assert_eq!(config.rate.window, 10);
        assert_eq!(
            config.filters,
            vec![
                FilterKind::Grayscale,
                FilterKind::GaussianBlur { sigma: 1.5 }
            ]
        );
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = Config::from_toml("[pipeline]\nbuffer_capacity = \"many\"").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn numeric_device_is_an_index() {
        let config = Config::from_toml("[capture.stream]\ndevice = 1").unwrap();
        assert_eq!(config.capture.stream.device, DeviceId::Index(1));
        assert_eq!(config.capture.stream.width, 960);
    }
}
