//! Producer/consumer frame pipeline
//!
//! ```text
//! device → FrameSource.grab → FrameBuffer.put ┆ FrameBuffer.get → FilterChain → FrameSink
//!          └──────── capture thread ────────┘   └──────── consumer thread ────────┘
//! ```
//!
//! The [`FrameBuffer`] is the only state the two threads share.

pub mod capture_loop;
pub mod consumer;
pub mod filter;
pub mod rate;
pub mod ringbuf;
pub mod sink;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

pub use capture_loop::{CaptureLoop, CaptureOptions};
pub use consumer::ConsumerLoop;
pub use filter::{Filter, FilterChain, FilterKind, FrameTransform};
pub use rate::{Clock, MonotonicClock, RateConfig, RateLimiter, RateSample, RateUpdate};
pub use ringbuf::{BufferStats, FrameBuffer, Pull};
pub use sink::{ChannelSink, FrameSink, SinkEvent};
pub use state::{EndReason, LoopState, StreamEvent};

use crate::capture::{FrameSource, SourceStatus, StreamConfig};
use crate::error::Result;
use crate::notify::{Subscribers, Subscription};
use crate::{PipelineConfig, PipelineStats};

pub struct Pipeline {
    capture: CaptureLoop,
    consumer: ConsumerLoop,
    buffer: Arc<FrameBuffer>,
    rate: RateConfig,
    events: Subscribers<StreamEvent>,
}

impl Pipeline {
    pub fn new(
        source: FrameSource,
        chain: FilterChain,
        sink: Arc<dyn FrameSink>,
        config: &PipelineConfig,
        rate: &RateConfig,
    ) -> Self {
        let buffer = Arc::new(FrameBuffer::new(
            config.buffer_capacity,
            Duration::from_millis(config.poll_interval_ms.max(1)),
        ));
        let events = Subscribers::new();
        let ceiling = ceiling_for(rate, &source.status());

        let capture = CaptureLoop::with_events(
            source,
            Arc::clone(&buffer),
            CaptureOptions {
                log_dropped_grabs: config.log_dropped_grabs,
                core: config.capture_core,
            },
            events.clone(),
        );
        let mut consumer = ConsumerLoop::with_events(
            Arc::clone(&buffer),
            chain,
            sink,
            rate.clone(),
            ceiling,
            events.clone(),
        );
        consumer.set_throttle(config.throttle);

        Self {
            capture,
            consumer,
            buffer,
            rate: rate.clone(),
            events,
        }
    }

    /// Start both loops. Already-running loops are left alone.
    pub fn start(&mut self) -> Result<()> {
        self.consumer
            .set_ceiling(ceiling_for(&self.rate, &self.capture.source_status()));
        self.consumer.start()?;
        if let Err(e) = self.capture.start() {
            self.consumer.stop();
            return Err(e);
        }
        Ok(())
    }

    /// Stop capture, then the consumer. Both are joined on return.
    pub fn stop(&mut self) {
        self.capture.stop();
        self.consumer.stop();
    }

    /// Stop both loops, reopen the source on `config`, and restart.
    ///
    /// Frames still buffered from the previous device are discarded. If the
    /// new device cannot be opened the pipeline stays stopped.
    #[instrument(skip(self), fields(device = %config.device))]
    pub fn switch_camera(&mut self, config: StreamConfig) -> Result<()> {
        info!("Switching camera");
        self.stop();
        let stale = self.buffer.clear();
        if stale > 0 {
            info!("Discarded {} frames from previous device", stale);
        }
        if let Err(e) = self.capture.reconfigure(config) {
            warn!("Camera switch failed: {}", e);
            return Err(e);
        }
        self.start()
    }

    /// Replace the filter chain, restarting the consumer if it was running.
    pub fn set_filters(&mut self, chain: FilterChain) -> Result<()> {
        let was_running = self.consumer.is_running();
        self.consumer.stop();
        self.consumer.set_chain(chain)?;
        if was_running {
            self.consumer.start()?;
        }
        Ok(())
    }

    /// Stop everything and release the capture device.
    pub fn release(&mut self) {
        self.capture.release();
        self.consumer.stop();
    }

    pub fn capture_state(&self) -> LoopState {
        self.capture.state()
    }

    pub fn consumer_state(&self) -> LoopState {
        self.consumer.state()
    }

    pub fn source_status(&self) -> SourceStatus {
        self.capture.source_status()
    }

    pub fn buffer(&self) -> &Arc<FrameBuffer> {
        &self.buffer
    }

    pub fn subscribe_events(&self, capacity: usize) -> Subscription<StreamEvent> {
        self.events.subscribe(capacity)
    }

    pub fn unsubscribe_events(&self, id: crate::notify::SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn subscribe_rate(&self, capacity: usize) -> Subscription<RateUpdate> {
        self.consumer.subscribe_rate(capacity)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            buffer: self.buffer.stats(),
            frames_grabbed: self.capture.frames_grabbed(),
            empty_grabs: self.capture.empty_grabs(),
            frames_processed: self.consumer.frames_processed(),
            frames_skipped: self.consumer.frames_skipped(),
            capture_state: self.capture.state(),
            consumer_state: self.consumer.state(),
        }
    }
}

fn ceiling_for(rate: &RateConfig, status: &SourceStatus) -> u32 {
    rate.ceiling_fps.unwrap_or_else(|| status.effective_fps())
}
