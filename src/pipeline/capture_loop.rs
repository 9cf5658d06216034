//! Background capture loop: FrameSource → FrameBuffer
//!
//! The frame source moves into the capture thread on [`CaptureLoop::start`]
//! and comes back through the join handle on [`CaptureLoop::stop`], so no
//! one else can touch the device while a grab may be in flight.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::capture::{FrameSource, SourceStatus, StreamConfig};
use crate::error::{GrabError, PipelineError, Result};
use crate::notify::{Subscribers, Subscription};
use crate::pipeline::ringbuf::FrameBuffer;
use crate::pipeline::state::{EndReason, LoopControl, LoopState, StreamEvent};

#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    /// Log every grab that produced no frame
    pub log_dropped_grabs: bool,
    /// Pin the capture thread to this CPU core
    pub core: Option<usize>,
}

#[derive(Debug, Default)]
struct Counters {
    grabbed: AtomicU64,
    empty_grabs: AtomicU64,
}

pub struct CaptureLoop {
    source: Option<FrameSource>,
    status: SourceStatus,
    buffer: Arc<FrameBuffer>,
    control: Arc<LoopControl>,
    handle: Option<JoinHandle<Option<FrameSource>>>,
    events: Subscribers<StreamEvent>,
    options: CaptureOptions,
    counters: Arc<Counters>,
}

impl CaptureLoop {
    pub fn new(source: FrameSource, buffer: Arc<FrameBuffer>, options: CaptureOptions) -> Self {
        Self::with_events(source, buffer, options, Subscribers::new())
    }

    /// Share an existing event registry, e.g. with a consumer loop.
    pub fn with_events(
        source: FrameSource,
        buffer: Arc<FrameBuffer>,
        options: CaptureOptions,
        events: Subscribers<StreamEvent>,
    ) -> Self {
        Self {
            status: source.status(),
            source: Some(source),
            buffer,
            control: Arc::new(LoopControl::new()),
            handle: None,
            events,
            options,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Spawn the capture thread. A no-op while already running.
    pub fn start(&mut self) -> Result<()> {
        self.launch(|worker| {
            thread::Builder::new()
                .name("framepipe-capture".into())
                .spawn(move || worker.run())
        })
    }

    /// Spawn a worker with `spawn` and hand it the source once it exists.
    /// If spawning fails the source stays with the loop.
    fn launch<S>(&mut self, spawn: S) -> Result<()>
    where
        S: FnOnce(Worker) -> io::Result<JoinHandle<Option<FrameSource>>>,
    {
        self.reap();
        if self.handle.is_some() {
            return Ok(());
        }

        let source = self.source.take().ok_or(PipelineError::SourceLost)?;
        let device = source.config().device;
        let (handover, inbox) = flume::bounded(1);

        self.control.begin();
        let worker = Worker {
            inbox,
            buffer: Arc::clone(&self.buffer),
            control: Arc::clone(&self.control),
            events: self.events.clone(),
            options: self.options.clone(),
            counters: Arc::clone(&self.counters),
        };

        let handle = match spawn(worker) {
            Ok(handle) => handle,
            Err(e) => {
                self.source = Some(source);
                self.control.set(LoopState::Idle);
                return Err(PipelineError::Spawn("capture", e));
            }
        };
        if let Err(flume::SendError(source)) = handover.send(source) {
            // The thread died before taking the source
            self.source = Some(source);
        }

        self.handle = Some(handle);
        info!("Capture loop started on {}", device);
        self.events.publish(StreamEvent::CaptureStarted { device });
        Ok(())
    }

    /// Signal the capture thread and wait for it to exit. When this returns
    /// no grab is in flight and none will happen until the next `start`.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            self.control.set(LoopState::Idle);
            return;
        };

        self.control.request_stop();
        debug!("Waiting for capture thread to join");
        self.join(handle);
        info!("Capture loop stopped");
        self.events.publish(StreamEvent::CaptureStopped {
            device: self.status.config().device,
        });
    }

    fn join(&mut self, handle: JoinHandle<Option<FrameSource>>) {
        match handle.join() {
            Ok(Some(source)) => self.source = Some(source),
            Ok(None) => {}
            Err(_) => error!("Capture thread panicked; frame source lost"),
        }
        self.control.set(LoopState::Idle);
    }

    /// Join a thread that already ended itself after a fatal grab.
    fn reap(&mut self) {
        if self.handle.as_ref().is_some_and(JoinHandle::is_finished) {
            if let Some(handle) = self.handle.take() {
                self.join(handle);
            }
        }
    }

    /// Point the source at a new device. The loop must be stopped first.
    pub fn reconfigure(&mut self, config: StreamConfig) -> Result<()> {
        self.reap();
        if self.handle.is_some() {
            return Err(PipelineError::AlreadyRunning("capture loop"));
        }
        let source = self.source.as_mut().ok_or(PipelineError::SourceLost)?;
        source.reconfigure(config)?;
        Ok(())
    }

    /// Stop, then release the device. Safe without a prior `start`.
    pub fn release(&mut self) {
        self.stop();
        if let Some(source) = self.source.as_mut() {
            source.release();
        }
    }

    pub fn state(&self) -> LoopState {
        self.control.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    pub fn source_status(&self) -> SourceStatus {
        self.status.clone()
    }

    pub fn frames_grabbed(&self) -> u64 {
        self.counters.grabbed.load(Ordering::Relaxed)
    }

    pub fn empty_grabs(&self) -> u64 {
        self.counters.empty_grabs.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self, capacity: usize) -> Subscription<StreamEvent> {
        self.events.subscribe(capacity)
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.release();
    }
}

struct Worker {
    inbox: flume::Receiver<FrameSource>,
    buffer: Arc<FrameBuffer>,
    control: Arc<LoopControl>,
    events: Subscribers<StreamEvent>,
    options: CaptureOptions,
    counters: Arc<Counters>,
}

impl Worker {
    fn run(self) -> Option<FrameSource> {
        let mut source = self.inbox.recv().ok()?;
        if let Some(core) = self.options.core {
            pin_to_core(core);
        }
        let device = source.config().device;

        while !self.control.stop_requested() {
            match source.grab() {
                Ok(frame) => {
                    self.counters.grabbed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("framepipe_frames_captured_total").increment(1);
                    self.buffer.put(frame);
                }
                // Allow frames to be dropped, notably while switching cameras
                Err(GrabError::NoFrame) => {
                    self.counters.empty_grabs.fetch_add(1, Ordering::Relaxed);
                    if self.options.log_dropped_grabs {
                        debug!("No frame from {}", device);
                    }
                }
                Err(e) => {
                    let reason = match e {
                        GrabError::StreamGone => {
                            warn!("Stream from {} is gone, capture stopping", device);
                            EndReason::StreamGone
                        }
                        other => {
                            error!("Capture from {} failed: {}", device, other);
                            EndReason::Error(other.to_string())
                        }
                    };
                    self.control.set(LoopState::Stopping);
                    self.events
                        .publish(StreamEvent::CaptureEnded { device, reason });
                    break;
                }
            }
        }

        Some(source)
    }
}

fn pin_to_core(core: usize) {
    let target = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .find(|id| id.id == core);
    match target {
        Some(id) if core_affinity::set_for_current(id) => debug!("Capture thread pinned to core {}", core),
        _ => warn!("Could not pin capture thread to core {}", core),
    }
}
