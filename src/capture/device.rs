//! Capture-device boundary
//!
//! A [`CaptureBackend`] knows how to open devices; an opened [`CaptureDevice`]
//! is a live handle that can be grabbed from and released. Hardware-specific
//! code lives behind these two traits so the loops only ever see frames and
//! [`GrabError`]s.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capture::frame::Frame;
use crate::error::{GrabError, OpenError};

/// Device identifier: an enumeration index or a filesystem path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceId {
    Index(u32),
    Path(String),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Index(i) => write!(f, "#{}", i),
            DeviceId::Path(p) => f.write_str(p),
        }
    }
}

impl From<u32> for DeviceId {
    fn from(index: u32) -> Self {
        DeviceId::Index(index)
    }
}

impl From<&str> for DeviceId {
    fn from(path: &str) -> Self {
        DeviceId::Path(path.to_owned())
    }
}

/// Requested stream parameters. Replaced as a whole on camera switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub device: DeviceId,
    pub width: u32,
    pub height: u32,
    pub desired_fps: u32,
}

impl StreamConfig {
    pub fn new(device: impl Into<DeviceId>, width: u32, height: u32, desired_fps: u32) -> Self {
        Self {
            device: device.into(),
            width,
            height,
            desired_fps,
        }
    }

    pub fn validate(&self) -> Result<(), OpenError> {
        if self.width == 0 || self.height == 0 {
            return Err(OpenError::InvalidConfig(format!(
                "frame size {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.desired_fps == 0 {
            return Err(OpenError::InvalidConfig(
                "desired_fps must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new(0, 960, 540, 24)
    }
}

/// Opens capture devices.
pub trait CaptureBackend: Send + 'static {
    /// Open the device and configure the requested frame size.
    fn open(
        &mut self,
        device: &DeviceId,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn CaptureDevice>, OpenError>;

    /// Ordered list of human-readable device names and their identifiers.
    fn enumerate(&self) -> Vec<(String, DeviceId)> {
        Vec::new()
    }
}

/// A live, opened capture device.
pub trait CaptureDevice: Send {
    /// Highest frame rate the device negotiated for the current format.
    fn native_fps(&self) -> f64;

    /// Ask the device to deliver at `fps`. Devices that cannot pace ignore it.
    fn set_fps(&mut self, _fps: u32) -> Result<(), OpenError> {
        Ok(())
    }

    /// Fetch the next frame. May block until a frame or a device timeout,
    /// which must be bounded: the capture loop only sees a stop request
    /// between grabs. A timeout is reported as [`GrabError::NoFrame`].
    fn grab(&mut self) -> Result<Frame, GrabError>;

    /// Release the underlying handle. Must tolerate repeated calls.
    fn release(&mut self);
}
