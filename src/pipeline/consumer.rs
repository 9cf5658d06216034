//! Consumer loop: FrameBuffer → FilterChain → FrameSink

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::error::{FilterError, PipelineError, Result};
use crate::notify::{Subscribers, Subscription};
use crate::pipeline::filter::FilterChain;
use crate::pipeline::rate::{RateConfig, RateLimiter, RateUpdate};
use crate::pipeline::ringbuf::{FrameBuffer, Pull};
use crate::pipeline::sink::FrameSink;
use crate::pipeline::state::{LoopControl, LoopState, StreamEvent};

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    skipped: AtomicU64,
}

pub struct ConsumerLoop {
    buffer: Arc<FrameBuffer>,
    chain: FilterChain,
    sink: Arc<dyn FrameSink>,
    rate: RateConfig,
    ceiling_fps: u32,
    throttle: bool,
    limiter: Option<RateLimiter>,
    rate_observers: Subscribers<RateUpdate>,
    control: Arc<LoopControl>,
    handle: Option<JoinHandle<RateLimiter>>,
    events: Subscribers<StreamEvent>,
    counters: Arc<Counters>,
}

impl ConsumerLoop {
    pub fn new(
        buffer: Arc<FrameBuffer>,
        chain: FilterChain,
        sink: Arc<dyn FrameSink>,
        rate: RateConfig,
        ceiling_fps: u32,
    ) -> Self {
        Self::with_events(buffer, chain, sink, rate, ceiling_fps, Subscribers::new())
    }

    pub fn with_events(
        buffer: Arc<FrameBuffer>,
        chain: FilterChain,
        sink: Arc<dyn FrameSink>,
        rate: RateConfig,
        ceiling_fps: u32,
        events: Subscribers<StreamEvent>,
    ) -> Self {
        let limiter = RateLimiter::new(&rate, ceiling_fps);
        Self {
            buffer,
            chain,
            sink,
            rate,
            ceiling_fps,
            throttle: true,
            rate_observers: limiter.observers().clone(),
            limiter: Some(limiter),
            control: Arc::new(LoopControl::new()),
            handle: None,
            events,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Disable the throttle sleep; rates are still measured.
    pub fn set_throttle(&mut self, throttle: bool) {
        self.throttle = throttle;
    }

    pub fn set_ceiling(&mut self, fps: u32) {
        self.ceiling_fps = fps;
    }

    pub fn ceiling_fps(&self) -> u32 {
        self.ceiling_fps
    }

    /// Replace the filter chain. The loop must be stopped first.
    pub fn set_chain(&mut self, chain: FilterChain) -> Result<()> {
        self.reap();
        if self.handle.is_some() {
            return Err(PipelineError::AlreadyRunning("consumer loop"));
        }
        self.chain = chain;
        Ok(())
    }

    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    pub fn start(&mut self) -> Result<()> {
        self.reap();
        if self.handle.is_some() {
            return Ok(());
        }

        let mut limiter = self
            .limiter
            .take()
            .unwrap_or_else(|| self.fresh_limiter());
        limiter.set_ceiling(self.ceiling_fps);
        limiter.reset();

        self.control.begin();
        let worker = Worker {
            buffer: Arc::clone(&self.buffer),
            chain: self.chain.clone(),
            sink: Arc::clone(&self.sink),
            limiter,
            throttle: self.throttle,
            control: Arc::clone(&self.control),
            events: self.events.clone(),
            counters: Arc::clone(&self.counters),
        };

        let handle = thread::Builder::new()
            .name("framepipe-consumer".into())
            .spawn(move || worker.run())
            .map_err(|e| {
                self.control.set(LoopState::Idle);
                PipelineError::Spawn("consumer", e)
            })?;
        self.handle = Some(handle);
        info!(
            "Consumer loop started ({} filters, ceiling {} fps)",
            self.chain.len(),
            self.ceiling_fps
        );
        Ok(())
    }

    /// Signal the consumer and wait for it to exit.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            self.control.set(LoopState::Idle);
            return;
        };
        self.control.request_stop();
        // Wake a consumer parked on the empty buffer
        self.buffer.wake_all();
        debug!("Waiting for consumer thread to join");
        self.join(handle);
        info!("Consumer loop stopped");
    }

    fn join(&mut self, handle: JoinHandle<RateLimiter>) {
        match handle.join() {
            Ok(limiter) => self.limiter = Some(limiter),
            Err(_) => error!("Consumer thread panicked"),
        }
        self.control.set(LoopState::Idle);
    }

    fn reap(&mut self) {
        if self.handle.as_ref().is_some_and(JoinHandle::is_finished) {
            if let Some(handle) = self.handle.take() {
                self.join(handle);
            }
        }
    }

    /// A replacement limiter that keeps publishing to existing observers
    fn fresh_limiter(&self) -> RateLimiter {
        RateLimiter::new(&self.rate, self.ceiling_fps).with_observers(self.rate_observers.clone())
    }

    pub fn state(&self) -> LoopState {
        self.control.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    pub fn frames_processed(&self) -> u64 {
        self.counters.processed.load(Ordering::Relaxed)
    }

    pub fn frames_skipped(&self) -> u64 {
        self.counters.skipped.load(Ordering::Relaxed)
    }

    pub fn subscribe_rate(&self, capacity: usize) -> Subscription<RateUpdate> {
        self.rate_observers.subscribe(capacity)
    }

    pub fn subscribe(&self, capacity: usize) -> Subscription<StreamEvent> {
        self.events.subscribe(capacity)
    }
}

impl Drop for ConsumerLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    buffer: Arc<FrameBuffer>,
    chain: FilterChain,
    sink: Arc<dyn FrameSink>,
    limiter: RateLimiter,
    throttle: bool,
    control: Arc<LoopControl>,
    events: Subscribers<StreamEvent>,
    counters: Arc<Counters>,
}

impl Worker {
    fn run(mut self) -> RateLimiter {
        loop {
            let frame = match self.buffer.get(&self.control.stop) {
                Pull::Frame(frame) => frame,
                Pull::Stopped => break,
            };

            let sequence = frame.sequence();
            match self.chain.process(frame) {
                Ok(out) => {
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                    self.sink.on_frame(out);
                }
                Err(e) if e.is_fatal() => {
                    error!("Filter chain is broken, consumer stopping: {}", e);
                    let (filter, reason) = match e {
                        FilterError::Broken { filter, reason } => (filter, reason),
                        other => (String::new(), other.to_string()),
                    };
                    self.control.set(LoopState::Stopping);
                    self.events
                        .publish(StreamEvent::FilterBroken { filter, reason });
                    break;
                }
                Err(e) => {
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("framepipe_frames_skipped_total").increment(1);
                    warn!("Skipping frame {}: {}", sequence, e);
                }
            }

            let update = self.limiter.update(self.throttle);
            self.sink.on_rate_update(update.fps);
        }

        self.limiter
    }
}
