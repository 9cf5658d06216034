//! V4L2 capture backend with memory-mapped buffers

use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, instrument, trace, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::decoder;
use crate::capture::device::{CaptureBackend, CaptureDevice, DeviceId};
use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::error::{GrabError, OpenError};

/// `ENODEV`: the device was unplugged under us.
const ENODEV: i32 = 19;

const DEFAULT_GRAB_TIMEOUT_MS: u64 = 200;

pub struct V4l2Backend {
    /// Preferred wire format; the device may negotiate another
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Longest a grab waits for the driver before reporting no frame
    pub grab_timeout: Duration,
}

impl Default for V4l2Backend {
    fn default() -> Self {
        Self {
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            grab_timeout: Duration::from_millis(DEFAULT_GRAB_TIMEOUT_MS),
        }
    }
}

fn device_path(device: &DeviceId) -> String {
    match device {
        DeviceId::Index(i) => format!("/dev/video{}", i),
        DeviceId::Path(p) => p.clone(),
    }
}

fn fourcc(format: PixelFormat) -> Option<FourCC> {
    match format {
        PixelFormat::Mjpeg => Some(FourCC::new(b"MJPG")),
        PixelFormat::Yuyv4 => Some(FourCC::new(b"YUYV")),
        PixelFormat::Rgb24 => Some(FourCC::new(b"RGB3")),
        PixelFormat::Bgr24 => Some(FourCC::new(b"BGR3")),
        PixelFormat::Nv12 => None,
    }
}

fn from_fourcc(code: FourCC) -> Option<PixelFormat> {
    match &code.repr {
        b"MJPG" => Some(PixelFormat::Mjpeg),
        b"YUYV" => Some(PixelFormat::Yuyv4),
        b"RGB3" => Some(PixelFormat::Rgb24),
        b"BGR3" => Some(PixelFormat::Bgr24),
        _ => None,
    }
}

impl CaptureBackend for V4l2Backend {
    #[instrument(skip(self))]
    fn open(
        &mut self,
        device: &DeviceId,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn CaptureDevice>, OpenError> {
        let path = device_path(device);
        let dev = Device::with_path(&path)
            .map_err(|e| OpenError::Unavailable(path.clone(), e.to_string()))?;

        // Query capabilities
        let caps = dev.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(OpenError::Unavailable(
                path,
                "device doesn't support video capture".into(),
            ));
        }

        let wanted = fourcc(self.format).ok_or_else(|| {
            OpenError::InvalidConfig(format!("unsupported pixel format {:?}", self.format))
        })?;

        let mut fmt = dev.format()?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = wanted;
        let fmt = dev.set_format(&fmt)?;

        let format = from_fourcc(fmt.fourcc).ok_or_else(|| OpenError::Format {
            device: path.clone(),
            width,
            height,
            reason: format!("device negotiated unsupported fourcc {}", fmt.fourcc),
        })?;
        if fmt.width != width || fmt.height != height {
            warn!(
                "Device adjusted {}x{} to {}x{}",
                width, height, fmt.width, fmt.height
            );
        }

        let mut stream = MmapStream::with_buffers(&dev, Type::VideoCapture, self.buffer_count)?;
        // A stalled device then reports TimedOut instead of blocking forever
        stream.set_timeout(self.grab_timeout.max(Duration::from_millis(1)));
        info!(
            "Capture stream started with {} buffers, grab timeout {:?}",
            self.buffer_count, self.grab_timeout
        );

        Ok(Box::new(V4l2Device {
            id: device.clone(),
            device: dev,
            stream: Some(stream),
            width: fmt.width,
            height: fmt.height,
            stride: fmt.stride,
            format,
            sequence: 0,
        }))
    }

    fn enumerate(&self) -> Vec<(String, DeviceId)> {
        enumerate_devices()
    }
}

/// Scan `/dev/video0..9` for devices with the capture capability.
pub fn enumerate_devices() -> Vec<(String, DeviceId)> {
    let mut found = Vec::new();
    for i in 0..10u32 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        if let Ok(caps) = dev.query_caps() {
            if caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                debug!("Found capture device: {} - {}", path, caps.card);
                found.push((caps.card, DeviceId::Index(i)));
            }
        }
    }
    found
}

struct V4l2Device {
    id: DeviceId,
    device: Device,
    stream: Option<MmapStream<'static>>,
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    sequence: u64,
}

fn classify(err: io::Error) -> GrabError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
            GrabError::NoFrame
        }
        _ if err.raw_os_error() == Some(ENODEV) => GrabError::StreamGone,
        _ => GrabError::Unknown(err.to_string()),
    }
}

impl CaptureDevice for V4l2Device {
    fn native_fps(&self) -> f64 {
        match self.device.params() {
            Ok(params) if params.interval.numerator > 0 => {
                f64::from(params.interval.denominator) / f64::from(params.interval.numerator)
            }
            _ => 0.0,
        }
    }

    fn set_fps(&mut self, fps: u32) -> Result<(), OpenError> {
        self.device.set_params(&Parameters::with_fps(fps))?;
        Ok(())
    }

    fn grab(&mut self) -> Result<Frame, GrabError> {
        let timestamp = Instant::now();
        let stream = self.stream.as_mut().ok_or(GrabError::StreamGone)?;

        let (buf, meta) = stream.next().map_err(classify)?;
        let used = (meta.bytesused as usize).min(buf.len());

        let rgb = match decoder::decode_frame(&buf[..used], self.format, self.width, self.height)
        {
            Ok(rgb) => rgb,
            Err(e) => {
                // A corrupt frame is dropped, not fatal
                trace!("Dropping undecodable frame: {}", e);
                return Err(GrabError::NoFrame);
            }
        };

        self.sequence += 1;
        let frame_meta = FrameMetadata {
            sequence: self.sequence,
            device: self.id.clone(),
            width: self.width,
            height: self.height,
            stride: self.width * 3,
            format: PixelFormat::Rgb24,
            device_timestamp: Some(
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            ),
        };
        trace!(
            "Grabbed frame {} ({} raw bytes, stride {})",
            self.sequence,
            used,
            self.stride
        );

        let mut frame = Frame::new(Bytes::from(rgb), frame_meta);
        frame.timestamp = timestamp;
        Ok(frame)
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            debug!("Released V4L2 stream for {}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_out_dequeue_is_a_dropped_frame() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF");
        assert_eq!(classify(err), GrabError::NoFrame);
    }

    #[test]
    fn unplugged_device_ends_the_stream() {
        assert_eq!(classify(io::Error::from_raw_os_error(ENODEV)), GrabError::StreamGone);
    }

    #[test]
    fn default_backend_bounds_each_grab() {
        let backend = V4l2Backend::default();
        assert!(!backend.grab_timeout.is_zero());
    }
}
