mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_until, Collector, FakeBackend};
use framepipe::capture::{DeviceId, FrameSource, StreamConfig, SyntheticBackend, SyntheticOptions};
use framepipe::pipeline::{Filter, FilterChain, FilterKind, LoopState, RateConfig};
use framepipe::{Pipeline, PipelineConfig};

const WAIT: Duration = Duration::from_secs(5);

fn unthrottled() -> PipelineConfig {
    PipelineConfig {
        buffer_capacity: 2,
        poll_interval_ms: 5,
        throttle: false,
        ..PipelineConfig::default()
    }
}

fn fake_pipeline(devices: u32) -> (Pipeline, Arc<Collector>, Arc<common::Probe>) {
    let (backend, probe) = FakeBackend::new(devices);
    let source = FrameSource::open(Box::new(backend), StreamConfig::new(0, 640, 480, 30)).unwrap();
    let sink = Arc::new(Collector::default());
    let pipeline = Pipeline::new(
        source,
        FilterChain::identity(),
        sink.clone(),
        &unthrottled(),
        &RateConfig::default(),
    );
    (pipeline, sink, probe)
}

#[test]
fn switching_cameras_delivers_only_the_new_device() {
    let (mut pipeline, sink, _probe) = fake_pipeline(2);
    pipeline.start().unwrap();
    assert!(wait_until(WAIT, || sink.len() >= 5));

    pipeline
        .switch_camera(StreamConfig::new(1, 1280, 720, 24))
        .unwrap();
    let mark = sink.len();

    let status = pipeline.source_status();
    assert_eq!(status.config(), StreamConfig::new(1, 1280, 720, 24));
    assert_eq!(status.effective_fps(), 24);
    assert!(status.is_open());

    assert!(wait_until(WAIT, || sink.len() >= mark + 5));
    pipeline.stop();

    let after = sink.devices_from(mark);
    assert!(after.iter().all(|d| *d == DeviceId::Index(1)));
    let frames = sink.frames.lock().unwrap();
    assert!(frames[mark..]
        .iter()
        .all(|f| f.width() == 1280 && f.height() == 720));
    assert!(frames[..mark]
        .iter()
        .all(|f| f.meta.device == DeviceId::Index(0)));
}

#[test]
fn failed_switch_leaves_the_pipeline_stopped() {
    let (mut pipeline, sink, _probe) = fake_pipeline(1);
    pipeline.start().unwrap();
    assert!(wait_until(WAIT, || sink.len() > 0));

    assert!(pipeline
        .switch_camera(StreamConfig::new(7, 640, 480, 30))
        .is_err());
    assert_eq!(pipeline.capture_state(), LoopState::Idle);
    assert_eq!(pipeline.consumer_state(), LoopState::Idle);
    assert!(!pipeline.source_status().is_open());

    // A later switch to a real device recovers
    pipeline
        .switch_camera(StreamConfig::new(0, 320, 240, 15))
        .unwrap();
    assert_eq!(pipeline.capture_state(), LoopState::Running);
    pipeline.release();
}

#[test]
fn start_twice_and_stop_when_idle() {
    let (mut pipeline, sink, probe) = fake_pipeline(1);
    pipeline.stop();
    pipeline.start().unwrap();
    pipeline.start().unwrap();
    assert!(wait_until(WAIT, || sink.len() > 3));
    pipeline.stop();
    pipeline.stop();

    assert_eq!(probe.max_in_flight.load(std::sync::atomic::Ordering::SeqCst), 1);
    let stats = pipeline.stats();
    assert_eq!(stats.capture_state, LoopState::Idle);
    assert_eq!(stats.consumer_state, LoopState::Idle);
    assert!(stats.frames_grabbed >= stats.frames_processed);
}

#[test]
fn set_filters_restarts_a_running_consumer() {
    let (mut pipeline, sink, _probe) = fake_pipeline(1);
    pipeline.start().unwrap();
    assert!(wait_until(WAIT, || sink.len() > 0));

    let marker = FilterChain::builder()
        .then(Filter::custom("marker", |f| Ok(f.with_data(vec![0xAB]))))
        .build();
    pipeline.set_filters(marker).unwrap();
    assert_eq!(pipeline.consumer_state(), LoopState::Running);

    let mark = sink.len();
    assert!(wait_until(WAIT, || sink.len() > mark + 3));
    pipeline.stop();
    assert!(sink.frames.lock().unwrap()[mark..]
        .iter()
        .all(|f| &f.data[..] == &[0xAB][..]));
}

#[test]
fn synthetic_source_runs_through_builtin_filters() {
    let backend = SyntheticBackend::new(SyntheticOptions {
        pace: false,
        ..SyntheticOptions::default()
    });
    let source = FrameSource::open(Box::new(backend), StreamConfig::new(0, 64, 48, 30)).unwrap();
    let sink = Arc::new(Collector::default());
    let chain = FilterChain::from_kinds(&[FilterKind::Grayscale, FilterKind::Invert]);
    let mut pipeline = Pipeline::new(
        source,
        chain,
        sink.clone(),
        &unthrottled(),
        &RateConfig::default(),
    );
    let events = pipeline.subscribe_events(8);

    pipeline.start().unwrap();
    assert!(wait_until(WAIT, || sink.len() >= 10));
    pipeline.release();

    let frames = sink.frames.lock().unwrap();
    let f = &frames[0];
    assert_eq!((f.width(), f.height()), (64, 48));
    // Grayscale keeps channels equal, and inversion preserves that
    let px = &f.data[..3];
    assert_eq!(px[0], px[1]);
    assert_eq!(px[1], px[2]);

    assert!(events.events.try_iter().any(|e| matches!(
        e,
        framepipe::pipeline::StreamEvent::CaptureStarted { .. }
    )));
    assert!(!pipeline.source_status().is_open());
}

#[test]
fn disconnect_stalls_but_does_not_crash() {
    let backend = SyntheticBackend::new(SyntheticOptions {
        pace: false,
        disconnect_after: Some(5),
        ..SyntheticOptions::default()
    });
    let source = FrameSource::open(Box::new(backend), StreamConfig::new(0, 32, 24, 30)).unwrap();
    let sink = Arc::new(Collector::default());
    let mut pipeline = Pipeline::new(
        source,
        FilterChain::identity(),
        sink.clone(),
        &unthrottled(),
        &RateConfig::default(),
    );

    pipeline.start().unwrap();
    assert!(wait_until(WAIT, || pipeline.capture_state() != LoopState::Running));
    assert_eq!(pipeline.consumer_state(), LoopState::Running);
    assert!(wait_until(WAIT, || sink.len() >= 1));
    assert!(pipeline.stats().frames_grabbed <= 5);
    pipeline.release();
}
