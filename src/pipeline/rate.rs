//! Frame-rate tracking and throttling

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::notify::{Subscribers, Subscription};

/// Time source for the limiter. Swappable so throttling is testable.
pub trait Clock: Send + 'static {
    /// Monotonic time since an arbitrary origin
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Throttle ceiling. `None` follows the source's effective frame rate.
    pub ceiling_fps: Option<u32>,
    /// Number of recent deltas averaged into the smoothed rate
    pub window: usize,
    pub min_delta_secs: f64,
    pub max_delta_secs: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            ceiling_fps: None,
            window: 10,
            min_delta_secs: 1e-6,
            max_delta_secs: 1.0,
        }
    }
}

/// Bounded window of inter-frame deltas, oldest evicted first.
/// Every stored delta lies within `[min, max]`.
#[derive(Debug, Clone)]
pub struct RateSample {
    deltas: VecDeque<f64>,
    capacity: usize,
    min: f64,
    max: f64,
}

impl RateSample {
    pub fn new(capacity: usize, min: f64, max: f64) -> Self {
        let capacity = capacity.max(1);
        // A non-positive floor would let a zero delta through
        let min = if min.is_finite() && min > 0.0 { min } else { 1e-6 };
        let max = if max.is_finite() { max.max(min) } else { 1.0_f64.max(min) };
        Self {
            deltas: VecDeque::with_capacity(capacity),
            capacity,
            min,
            max,
        }
    }

    /// Saturate `delta` into range, store it and return the stored value.
    pub fn record(&mut self, delta: f64) -> f64 {
        let delta = if delta.is_nan() {
            self.min
        } else {
            delta.clamp(self.min, self.max)
        };
        if self.deltas.len() == self.capacity {
            self.deltas.pop_front();
        }
        self.deltas.push_back(delta);
        delta
    }

    /// `1 / mean(deltas)`, or zero for an empty window.
    pub fn rate(&self) -> f64 {
        if self.deltas.is_empty() {
            return 0.0;
        }
        let mean = self.deltas.iter().sum::<f64>() / self.deltas.len() as f64;
        1.0 / mean
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn deltas(&self) -> impl Iterator<Item = f64> + '_ {
        self.deltas.iter().copied()
    }
}

/// Published after every [`RateLimiter::update`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateUpdate {
    /// Smoothed frames per second
    pub fps: f64,
    /// Delta recorded by this update, after saturation
    pub delta: Duration,
    /// Time spent throttling in this update
    pub slept: Duration,
}

pub struct RateLimiter<C: Clock = MonotonicClock> {
    sample: RateSample,
    ceiling_fps: u32,
    clock: C,
    last: Duration,
    rate: f64,
    observers: Subscribers<RateUpdate>,
}

impl RateLimiter<MonotonicClock> {
    pub fn new(config: &RateConfig, ceiling_fps: u32) -> Self {
        Self::with_clock(config, ceiling_fps, MonotonicClock::default())
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(config: &RateConfig, ceiling_fps: u32, clock: C) -> Self {
        let last = clock.now();
        Self {
            sample: RateSample::new(config.window, config.min_delta_secs, config.max_delta_secs),
            ceiling_fps,
            clock,
            last,
            rate: 0.0,
            observers: Subscribers::new(),
        }
    }

    /// Publish to an existing registry instead of a fresh one.
    pub fn with_observers(mut self, observers: Subscribers<RateUpdate>) -> Self {
        self.observers = observers;
        self
    }

    /// Record the time since the previous call, optionally sleep to hold the
    /// ceiling, and publish the smoothed rate.
    ///
    /// The recorded delta is measured before the throttle sleep, and the next
    /// delta starts after it, so the published rate reflects processing cost
    /// rather than the throttle.
    pub fn update(&mut self, throttle: bool) -> RateUpdate {
        let now = self.clock.now();
        let elapsed = now.saturating_sub(self.last).as_secs_f64();
        let delta = self.sample.record(elapsed);
        self.rate = self.sample.rate();

        let mut slept = Duration::ZERO;
        if throttle && self.ceiling_fps > 0 {
            let budget = 1.0 / f64::from(self.ceiling_fps) - delta;
            if budget > 0.0 {
                slept = Duration::from_secs_f64(budget);
                self.clock.sleep(slept);
            }
        }
        self.last = self.clock.now();

        let update = RateUpdate {
            fps: self.rate,
            delta: Duration::from_secs_f64(delta),
            slept,
        };
        trace!("fps {:.1} (delta {:?}, slept {:?})", update.fps, update.delta, slept);
        metrics::gauge!("framepipe_consumer_fps").set(update.fps);
        self.observers.publish(update);
        update
    }

    /// Restart timing from now, e.g. after the consumer was paused.
    pub fn reset(&mut self) {
        self.last = self.clock.now();
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn ceiling_fps(&self) -> u32 {
        self.ceiling_fps
    }

    pub fn set_ceiling(&mut self, fps: u32) {
        self.ceiling_fps = fps;
    }

    pub fn sample(&self) -> &RateSample {
        &self.sample
    }

    pub fn subscribe(&self, capacity: usize) -> Subscription<RateUpdate> {
        self.observers.subscribe(capacity)
    }

    pub fn observers(&self) -> &Subscribers<RateUpdate> {
        &self.observers
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Clock that only moves when told to; sleeps advance it and are recorded.
    #[derive(Clone, Default)]
    pub(crate) struct ManualClock {
        now: Arc<Mutex<Duration>>,
        pub(crate) sleeps: Arc<Mutex<Vec<Duration>>>,
    }

    impl ManualClock {
        pub(crate) fn advance(&self, by: Duration) {
            *self.now.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Duration {
            *self.now.lock().unwrap()
        }

        fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
            self.advance(duration);
        }
    }

    fn limiter(ceiling: u32) -> (RateLimiter<ManualClock>, ManualClock) {
        let clock = ManualClock::default();
        let limiter = RateLimiter::with_clock(&RateConfig::default(), ceiling, clock.clone());
        (limiter, clock)
    }

    #[test]
    fn empty_sample_rate_is_zero() {
        assert_eq!(RateSample::new(4, 1e-3, 1.0).rate(), 0.0);
    }

    #[test]
    fn sample_saturates_and_evicts_oldest() {
        let mut sample = RateSample::new(2, 0.01, 0.5);
        assert_eq!(sample.record(0.0), 0.01);
        assert_eq!(sample.record(3.0), 0.5);
        sample.record(0.1);
        assert_eq!(sample.deltas().collect::<Vec<_>>(), vec![0.5, 0.1]);
    }

    #[test]
    fn non_positive_floor_is_replaced() {
        let mut sample = RateSample::new(2, 0.0, 1.0);
        assert!(sample.record(0.0) > 0.0);
        assert!(sample.rate().is_finite());
    }

    #[test]
    fn zero_delta_never_divides_by_zero() {
        let (mut limiter, _clock) = limiter(0);
        for _ in 0..5 {
            let update = limiter.update(false);
            assert!(update.fps.is_finite());
            assert!(update.delta > Duration::ZERO);
        }
    }

    #[test]
    fn fixed_delta_converges_to_inverse() {
        let (mut limiter, clock) = limiter(0);
        let delta = Duration::from_millis(40);
        let mut last = 0.0;
        for _ in 0..RateConfig::default().window {
            clock.advance(delta);
            last = limiter.update(false).fps;
        }
        assert!((last - 25.0).abs() < 1e-6, "got {}", last);
    }

    #[test]
    fn throttle_sleeps_remaining_budget() {
        let (mut limiter, clock) = limiter(20);
        clock.advance(Duration::from_millis(10));
        let update = limiter.update(true);
        assert!((update.slept.as_secs_f64() - 0.040).abs() < 1e-6);
        assert_eq!(clock.sleeps.lock().unwrap().len(), 1);
    }

    #[test]
    fn throttle_skips_sleep_when_over_budget() {
        let (mut limiter, clock) = limiter(20);
        clock.advance(Duration::from_millis(80));
        assert_eq!(limiter.update(true).slept, Duration::ZERO);
        assert!(clock.sleeps.lock().unwrap().is_empty());
    }

    #[test]
    fn recorded_delta_excludes_throttle_sleep() {
        let (mut limiter, clock) = limiter(10);
        for _ in 0..3 {
            clock.advance(Duration::from_millis(20));
            limiter.update(true);
        }
        // Each update slept 80ms, none of it shows up in the sample
        assert!(limiter.sample().deltas().all(|d| (d - 0.020).abs() < 1e-9));
        assert!((limiter.rate() - 50.0).abs() < 1e-6);
    }

    #[test]
    fn updates_are_published() {
        let (mut limiter, clock) = limiter(0);
        let sub = limiter.subscribe(4);
        clock.advance(Duration::from_millis(50));
        limiter.update(false);
        let update = sub.events.try_recv().unwrap();
        assert!((update.fps - 20.0).abs() < 1e-6);
        assert!(limiter.observers().unsubscribe(sub.id));
    }
}
