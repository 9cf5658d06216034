//! Frame source: owns one capture device through its open/grab/release lifecycle

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info, instrument, warn};

use crate::capture::device::{CaptureBackend, CaptureDevice, StreamConfig};
use crate::capture::frame::Frame;
use crate::error::{GrabError, OpenError};

/// Snapshot of what the source is currently streaming
#[derive(Debug, Clone, PartialEq)]
pub struct SourceState {
    pub config: StreamConfig,
    /// Desired FPS clamped to the device's native maximum
    pub effective_fps: u32,
    pub native_fps: f64,
    pub open: bool,
}

/// Read-only view of a [`FrameSource`]'s state, usable from any thread
#[derive(Clone)]
pub struct SourceStatus {
    state: Arc<ArcSwap<SourceState>>,
}

impl SourceStatus {
    pub fn snapshot(&self) -> Arc<SourceState> {
        self.state.load_full()
    }

    pub fn config(&self) -> StreamConfig {
        self.state.load().config.clone()
    }

    pub fn effective_fps(&self) -> u32 {
        self.state.load().effective_fps
    }

    pub fn is_open(&self) -> bool {
        self.state.load().open
    }
}

pub struct FrameSource {
    backend: Box<dyn CaptureBackend>,
    device: Option<Box<dyn CaptureDevice>>,
    state: Arc<ArcSwap<SourceState>>,
}

impl FrameSource {
    /// Open the configured device through `backend`.
    pub fn open(backend: Box<dyn CaptureBackend>, config: StreamConfig) -> Result<Self, OpenError> {
        let state = Arc::new(ArcSwap::from_pointee(SourceState {
            config: config.clone(),
            effective_fps: 0,
            native_fps: 0.0,
            open: false,
        }));
        let mut source = Self {
            backend,
            device: None,
            state,
        };
        source.open_device(config)?;
        Ok(source)
    }

    #[instrument(skip(self), fields(device = %config.device))]
    fn open_device(&mut self, config: StreamConfig) -> Result<(), OpenError> {
        config.validate()?;

        let mut device = self
            .backend
            .open(&config.device, config.width, config.height)?;

        let native_fps = device.native_fps();
        let effective_fps = clamp_fps(config.desired_fps, native_fps);
        if effective_fps < config.desired_fps {
            warn!(
                "Requested {} fps but device only supports {:.1}, falling back to {}",
                config.desired_fps, native_fps, effective_fps
            );
        }

        if let Err(e) = device.set_fps(effective_fps) {
            device.release();
            return Err(e);
        }

        info!(
            "Opened capture device {} at {}x{} @ {} fps",
            config.device, config.width, config.height, effective_fps
        );

        self.device = Some(device);
        self.state.store(Arc::new(SourceState {
            config,
            effective_fps,
            native_fps,
            open: true,
        }));
        Ok(())
    }

    /// Grab the next frame. A closed source reports [`GrabError::StreamGone`].
    pub fn grab(&mut self) -> Result<Frame, GrabError> {
        match self.device.as_mut() {
            Some(device) => device.grab(),
            None => Err(GrabError::StreamGone),
        }
    }

    /// Close the current device and open `config` in its place.
    ///
    /// If the new device fails to open the source is left closed and
    /// further grabs report the stream as gone.
    #[instrument(skip(self), fields(device = %config.device))]
    pub fn reconfigure(&mut self, config: StreamConfig) -> Result<(), OpenError> {
        self.release();
        self.state.rcu(|prev| SourceState {
            config: config.clone(),
            open: false,
            ..SourceState::clone(prev)
        });
        self.open_device(config)
    }

    /// Release the device. Safe to call repeatedly and after a failed open.
    pub fn release(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.release();
            debug!("Released capture device {}", self.state.load().config.device);
        }
        if self.state.load().open {
            self.state.rcu(|prev| SourceState {
                open: false,
                ..SourceState::clone(prev)
            });
        }
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn config(&self) -> StreamConfig {
        self.state.load().config.clone()
    }

    pub fn status(&self) -> SourceStatus {
        SourceStatus {
            state: Arc::clone(&self.state),
        }
    }

    pub fn backend(&self) -> &dyn CaptureBackend {
        self.backend.as_ref()
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Clamp `desired` to the device maximum. Unknown maxima (zero, negative,
/// NaN) leave the request untouched.
fn clamp_fps(desired: u32, native: f64) -> u32 {
    if native.is_finite() && native >= 1.0 && f64::from(desired) > native {
        native as u32
    } else {
        desired
    }
}
