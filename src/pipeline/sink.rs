//! Render sink boundary

use flume::{Receiver, Sender, TrySendError};
use tracing::trace;

use crate::capture::Frame;

/// Receives processed frames and rate updates from the consumer thread.
///
/// Calls happen on the consumer thread and must not block indefinitely;
/// UI implementations should hand off to their own thread.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: Frame);

    fn on_rate_update(&self, _fps: f64) {}
}

#[derive(Debug, Clone)]
pub enum SinkEvent {
    Frame(Frame),
    Rate(f64),
}

/// Sink that forwards events into a bounded flume channel, dropping an
/// event rather than stalling the consumer when the receiver falls behind.
pub struct ChannelSink {
    tx: Sender<SinkEvent>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<SinkEvent>) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        (Self { tx }, rx)
    }

    fn forward(&self, event: SinkEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!("Render channel full, event dropped"),
            Err(TrySendError::Disconnected(_)) => trace!("Render channel closed"),
        }
    }
}

impl FrameSink for ChannelSink {
    fn on_frame(&self, frame: Frame) {
        self.forward(SinkEvent::Frame(frame));
    }

    fn on_rate_update(&self, fps: f64) {
        self.forward(SinkEvent::Rate(fps));
    }
}

impl<F> FrameSink for F
where
    F: Fn(Frame) + Send + Sync,
{
    fn on_frame(&self, frame: Frame) {
        self(frame)
    }
}
