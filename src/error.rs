//! Error taxonomy for the capture/consume pipeline

use thiserror::Error;

use crate::capture::frame::PixelFormat;

/// Failure to bring a capture device up. Surfaced to the caller, never retried.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("capture device {0} is unavailable: {1}")]
    Unavailable(String, String),

    #[error("capture device {device} rejected {width}x{height}: {reason}")]
    Format {
        device: String,
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("invalid stream configuration: {0}")]
    InvalidConfig(String),

    #[error("io error while opening device: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a grab that did not produce a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrabError {
    /// Nothing ready yet. The caller retries; the frame is dropped.
    #[error("no frame available")]
    NoFrame,

    /// Device disconnected or never opened. Fatal for the stream.
    #[error("stream is gone")]
    StreamGone,

    #[error("unknown capture error: {0}")]
    Unknown(String),
}

impl GrabError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, GrabError::NoFrame)
    }
}

/// Failure raised by a filter in the chain.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    /// The current frame could not be processed. It is skipped.
    #[error("filter {filter} failed on frame: {reason}")]
    Frame { filter: String, reason: String },

    /// Filter does not handle this pixel layout. The frame is skipped.
    #[error("filter {filter} does not support {format:?}")]
    Unsupported { filter: String, format: PixelFormat },

    /// The filter's model or resource is permanently broken.
    #[error("filter {filter} is broken: {reason}")]
    Broken { filter: String, reason: String },
}

impl FilterError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FilterError::Broken { .. })
    }
}

/// Errors from the loop and pipeline control surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Open(#[from] OpenError),

    #[error("{0} is running; stop it first")]
    AlreadyRunning(&'static str),

    /// The capture thread panicked and took the frame source with it.
    #[error("frame source was lost")]
    SourceLost,

    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
