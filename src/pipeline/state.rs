use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::capture::DeviceId;

/// Lifecycle of a capture or consumer loop: `Idle → Running → Stopping → Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Idle = 0,
    Running = 1,
    /// Stop requested, or the loop ended itself and has not been joined yet
    Stopping = 2,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LoopState::Running,
            2 => LoopState::Stopping,
            _ => LoopState::Idle,
        }
    }
}

/// State and stop flag shared between a loop handle and its thread
#[derive(Debug)]
pub(crate) struct LoopControl {
    state: AtomicU8,
    pub(crate) stop: AtomicBool,
}

impl LoopControl {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(LoopState::Idle as u8),
            stop: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: LoopState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn begin(&self) {
        self.stop.store(false, Ordering::Release);
        self.set(LoopState::Running);
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        // Only Running moves to Stopping; a loop that ended itself already did
        let _ = self.state.compare_exchange(
            LoopState::Running as u8,
            LoopState::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Why a stream ended without being asked to
#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    /// Device disconnected or never opened
    StreamGone,
    Error(String),
}

/// Notifications published by the loops
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    CaptureStarted { device: DeviceId },
    /// Capture hit a fatal grab error and stopped itself
    CaptureEnded { device: DeviceId, reason: EndReason },
    CaptureStopped { device: DeviceId },
    /// A filter reported itself permanently broken; the consumer stopped
    FilterBroken { filter: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_request_moves_running_to_stopping() {
        let control = LoopControl::new();
        control.request_stop();
        assert_eq!(control.state(), LoopState::Idle);

        control.begin();
        assert_eq!(control.state(), LoopState::Running);
        assert!(!control.stop_requested());

        control.request_stop();
        assert_eq!(control.state(), LoopState::Stopping);
        assert!(control.stop_requested());
    }
}
