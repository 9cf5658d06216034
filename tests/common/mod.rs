//! Instrumented fake capture backend shared by the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use framepipe::capture::{
    CaptureBackend, CaptureDevice, DeviceId, Frame, FrameMetadata, PixelFormat,
};
use framepipe::error::{GrabError, OpenError};
use framepipe::pipeline::FrameSink;

/// Scripted outcome of one grab
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    Frame,
    NoFrame,
    Gone,
    Fail,
}

/// Counters observed by the tests
#[derive(Default)]
pub struct Probe {
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub grabs: AtomicUsize,
    pub releases: AtomicUsize,
    /// Set if a device was released while a grab was running
    pub raced: AtomicBool,
    pub opened: Mutex<Vec<(DeviceId, u32, u32)>>,
    pub script: Mutex<VecDeque<Step>>,
}

impl Probe {
    pub fn script(&self, steps: &[Step]) {
        self.script.lock().unwrap().extend(steps.iter().copied());
    }

    pub fn grabs(&self) -> usize {
        self.grabs.load(Ordering::SeqCst)
    }
}

pub struct FakeBackend {
    pub probe: Arc<Probe>,
    pub devices: u32,
    pub native_fps: f64,
    pub grab_delay: Duration,
}

impl FakeBackend {
    pub fn new(devices: u32) -> (Self, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        (
            Self {
                probe: Arc::clone(&probe),
                devices,
                native_fps: 30.0,
                grab_delay: Duration::from_millis(1),
            },
            probe,
        )
    }
}

impl CaptureBackend for FakeBackend {
    fn open(
        &mut self,
        device: &DeviceId,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn CaptureDevice>, OpenError> {
        match device {
            DeviceId::Index(i) if *i < self.devices => {}
            _ => return Err(OpenError::Unavailable(device.to_string(), "no such fake".into())),
        }
        self.probe
            .opened
            .lock()
            .unwrap()
            .push((device.clone(), width, height));
        Ok(Box::new(FakeDevice {
            probe: Arc::clone(&self.probe),
            device: device.clone(),
            width,
            height,
            native_fps: self.native_fps,
            grab_delay: self.grab_delay,
            sequence: 0,
        }))
    }

    fn enumerate(&self) -> Vec<(String, DeviceId)> {
        (0..self.devices)
            .map(|i| (format!("Fake {}", i), DeviceId::Index(i)))
            .collect()
    }
}

struct FakeDevice {
    probe: Arc<Probe>,
    device: DeviceId,
    width: u32,
    height: u32,
    native_fps: f64,
    grab_delay: Duration,
    sequence: u64,
}

impl CaptureDevice for FakeDevice {
    fn native_fps(&self) -> f64 {
        self.native_fps
    }

    fn grab(&mut self) -> Result<Frame, GrabError> {
        let now = self.probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.probe.grabs.fetch_add(1, Ordering::SeqCst);

        thread::sleep(self.grab_delay);
        let step = self
            .probe
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Frame);

        self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);

        match step {
            Step::Frame => {
                self.sequence += 1;
                // Payload size is irrelevant to the loops; keep it tiny
                Ok(Frame::new(
                    vec![self.sequence as u8; 3],
                    FrameMetadata {
                        sequence: self.sequence,
                        device: self.device.clone(),
                        width: self.width,
                        height: self.height,
                        stride: 0,
                        format: PixelFormat::Rgb24,
                        device_timestamp: None,
                    },
                ))
            }
            Step::NoFrame => Err(GrabError::NoFrame),
            Step::Gone => Err(GrabError::StreamGone),
            Step::Fail => Err(GrabError::Unknown("scripted failure".into())),
        }
    }

    fn release(&mut self) {
        if self.probe.in_flight.load(Ordering::SeqCst) > 0 {
            self.probe.raced.store(true, Ordering::SeqCst);
        }
        self.probe.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sink that records everything it is handed
#[derive(Default)]
pub struct Collector {
    pub frames: Mutex<Vec<Frame>>,
    pub rates: Mutex<Vec<f64>>,
}

impl Collector {
    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn devices_from(&self, start: usize) -> Vec<DeviceId> {
        self.frames.lock().unwrap()[start..]
            .iter()
            .map(|f| f.meta.device.clone())
            .collect()
    }
}

impl FrameSink for Collector {
    fn on_frame(&self, frame: Frame) {
        self.frames.lock().unwrap().push(frame);
    }

    fn on_rate_update(&self, fps: f64) {
        self.rates.lock().unwrap().push(fps);
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// A tiny RGB frame tagged with `sequence`
pub fn frame(sequence: u64) -> Frame {
    Frame::new(
        vec![0u8; 2 * 2 * 3],
        FrameMetadata {
            sequence,
            device: DeviceId::Index(0),
            width: 2,
            height: 2,
            stride: 6,
            format: PixelFormat::Rgb24,
            device_timestamp: None,
        },
    )
}
