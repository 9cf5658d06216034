//! Virtual capture backend that emits test-pattern frames

use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::debug;

use crate::capture::device::{CaptureBackend, CaptureDevice, DeviceId};
use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::error::{GrabError, OpenError};

#[derive(Debug, Clone)]
pub struct SyntheticOptions {
    /// Number of virtual cameras, addressable as `DeviceId::Index(0..devices)`
    pub devices: u32,
    /// Maximum rate the virtual sensor reports
    pub native_fps: f64,
    /// Sleep between grabs so frames arrive at the negotiated rate
    pub pace: bool,
    /// Report the stream as gone after this many frames
    pub disconnect_after: Option<u64>,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self {
            devices: 2,
            native_fps: 30.0,
            pace: true,
            disconnect_after: None,
        }
    }
}

pub struct SyntheticBackend {
    options: SyntheticOptions,
}

impl SyntheticBackend {
    pub fn new(options: SyntheticOptions) -> Self {
        Self { options }
    }
}

impl CaptureBackend for SyntheticBackend {
    fn open(
        &mut self,
        device: &DeviceId,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn CaptureDevice>, OpenError> {
        let index = match device {
            DeviceId::Index(i) if *i < self.options.devices => *i,
            _ => {
                return Err(OpenError::Unavailable(
                    device.to_string(),
                    format!("only {} synthetic devices exist", self.options.devices),
                ))
            }
        };

        debug!("Opening synthetic camera {} at {}x{}", index, width, height);
        Ok(Box::new(SyntheticDevice {
            index,
            width,
            height,
            options: self.options.clone(),
            fps: self.options.native_fps,
            sequence: 0,
            next_deadline: None,
            released: false,
        }))
    }

    fn enumerate(&self) -> Vec<(String, DeviceId)> {
        (0..self.options.devices)
            .map(|i| (format!("Synthetic Camera {}", i), DeviceId::Index(i)))
            .collect()
    }
}

struct SyntheticDevice {
    index: u32,
    width: u32,
    height: u32,
    options: SyntheticOptions,
    fps: f64,
    sequence: u64,
    next_deadline: Option<Instant>,
    released: bool,
}

impl SyntheticDevice {
    fn pace(&mut self) {
        if !self.options.pace || self.fps <= 0.0 {
            return;
        }
        let period = Duration::from_secs_f64(1.0 / self.fps);
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        // Don't accumulate debt after a stall
        self.next_deadline = Some(deadline.max(now) + period);
    }

    fn render(&self) -> BytesMut {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = BytesMut::zeroed(w * h * 3);
        let shift = self.sequence as usize;
        let tint = (self.index as u8).wrapping_mul(85);
        for (y, row) in data.chunks_exact_mut(w * 3).enumerate() {
            for (x, px) in row.chunks_exact_mut(3).enumerate() {
                px[0] = ((x + shift) * 255 / w.max(1)) as u8;
                px[1] = (y * 255 / h.max(1)) as u8;
                px[2] = tint;
            }
        }
        data
    }
}

impl CaptureDevice for SyntheticDevice {
    fn native_fps(&self) -> f64 {
        self.options.native_fps
    }

    fn set_fps(&mut self, fps: u32) -> Result<(), OpenError> {
        self.fps = f64::from(fps);
        Ok(())
    }

    fn grab(&mut self) -> Result<Frame, GrabError> {
        if self.released {
            return Err(GrabError::StreamGone);
        }
        if let Some(limit) = self.options.disconnect_after {
            if self.sequence >= limit {
                return Err(GrabError::StreamGone);
            }
        }

        self.pace();
        self.sequence += 1;

        let meta = FrameMetadata {
            sequence: self.sequence,
            device: DeviceId::Index(self.index),
            width: self.width,
            height: self.height,
            stride: self.width * 3,
            format: PixelFormat::Rgb24,
            device_timestamp: None,
        };
        Ok(Frame::new(self.render().freeze(), meta))
    }

    fn release(&mut self) {
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unpaced() -> SyntheticBackend {
        SyntheticBackend::new(SyntheticOptions {
            pace: false,
            ..SyntheticOptions::default()
        })
    }

    #[test]
    fn frames_carry_device_identity_and_sequence() {
        let mut backend = unpaced();
        let mut device = backend.open(&DeviceId::Index(1), 8, 4).unwrap();
        let a = device.grab().unwrap();
        let b = device.grab().unwrap();
        assert_eq!(a.meta.device, DeviceId::Index(1));
        assert_eq!(a.data.len(), 8 * 4 * 3);
        assert_eq!(b.sequence(), a.sequence() + 1);
        assert_eq!(a.data[2], 85);
    }

    #[test]
    fn unknown_device_fails_to_open() {
        let mut backend = unpaced();
        assert!(backend.open(&DeviceId::Index(5), 8, 4).is_err());
        assert!(backend.open(&DeviceId::from("/dev/video0"), 8, 4).is_err());
    }

    #[test]
    fn disconnect_after_limit() {
        let mut backend = SyntheticBackend::new(SyntheticOptions {
            pace: false,
            disconnect_after: Some(2),
            ..SyntheticOptions::default()
        });
        let mut device = backend.open(&DeviceId::Index(0), 4, 4).unwrap();
        assert!(device.grab().is_ok());
        assert!(device.grab().is_ok());
        assert_eq!(device.grab().unwrap_err(), GrabError::StreamGone);
    }

    #[test]
    fn enumerates_in_index_order() {
        let names: Vec<_> = unpaced().enumerate().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Synthetic Camera 0", "Synthetic Camera 1"]);
    }
}
