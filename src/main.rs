//! framepipe demo: capture → filters → render stand-in
//!
//! Usage: `framepipe [config.toml]`. Ctrl-C quits; on Unix, SIGHUP switches
//! to the next enumerated camera.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tracing::{error, info, warn};

use framepipe::capture::{DeviceId, FrameSource, StreamConfig};
use framepipe::pipeline::{ChannelSink, FilterChain, SinkEvent, StreamEvent};
use framepipe::{utils, Config, Pipeline};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "framepipe=info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("framepipe launching...");

    // Load configuration
    let path = std::env::args().nth(1).map(PathBuf::from);
    framepipe::CONFIG.store(Arc::new(Config::load(path.as_deref())?));
    let config = framepipe::CONFIG.load_full();

    let backend = utils::open_backend(&config.capture)?;
    let devices = backend.enumerate();
    for (name, id) in &devices {
        info!("Available camera: {} ({})", name, id);
    }

    let mut stream = config.capture.stream.clone();
    stream.device = utils::auto_detect_device(backend.as_ref(), &stream.device)?;
    info!("Using capture device: {}", stream.device);

    let source = FrameSource::open(backend, stream)?;
    let chain = FilterChain::from_kinds(&config.filters);
    info!("Filters: {:?}", chain.names());

    let (sink, frames) = ChannelSink::bounded(4);
    let mut pipeline = Pipeline::new(
        source,
        chain,
        Arc::new(sink),
        &config.pipeline,
        &config.rate,
    );
    let stream_events = pipeline.subscribe_events(16);
    pipeline.start()?;

    // Render stand-in: drain the sink the way a UI thread would
    let render = tokio::spawn(async move {
        let mut rendered = 0u64;
        let mut fps = 0.0;
        while let Ok(event) = frames.recv_async().await {
            match event {
                SinkEvent::Frame(frame) => {
                    rendered += 1;
                    if rendered % 100 == 0 {
                        info!(
                            "Rendered {} frames, last #{} from {} at {:.1} fps",
                            rendered,
                            frame.sequence(),
                            frame.meta.device,
                            fps
                        );
                    }
                }
                SinkEvent::Rate(rate) => fps = rate,
            }
        }
        rendered
    });

    let mut stats_tick = tokio::time::interval(Duration::from_secs(10));
    #[cfg(unix)]
    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    loop {
        #[cfg(unix)]
        let switch_requested = hangup.recv();
        #[cfg(not(unix))]
        let switch_requested = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
            event = stream_events.events.recv_async() => match event {
                Ok(StreamEvent::CaptureEnded { device, reason }) => {
                    error!("Stream from {} ended: {:?}; display is stalled", device, reason);
                }
                Ok(StreamEvent::FilterBroken { filter, reason }) => {
                    error!("Filter {} is broken: {}", filter, reason);
                }
                Ok(other) => info!("Pipeline event: {:?}", other),
                Err(_) => break,
            },
            _ = stats_tick.tick() => {
                info!("Stats: {:?}", pipeline.stats());
            }
            _ = switch_requested => {
                let current = pipeline.source_status().config();
                let Some(next) = next_device(&devices, &current.device) else {
                    warn!("No other camera to switch to");
                    continue;
                };
                let target = StreamConfig { device: next, ..current };
                if let Err(e) = tokio::task::block_in_place(|| pipeline.switch_camera(target)) {
                    error!("Camera switch failed: {}", e);
                }
            }
        }
    }

    tokio::task::block_in_place(|| pipeline.release());
    drop(pipeline);
    let rendered = render.await?;

    info!("framepipe shutting down after {} frames", rendered);
    Ok(())
}

fn next_device(devices: &[(String, DeviceId)], current: &DeviceId) -> Option<DeviceId> {
    if devices.len() < 2 {
        return None;
    }
    let pos = devices.iter().position(|(_, id)| id == current).unwrap_or(0);
    Some(devices[(pos + 1) % devices.len()].1.clone())
}
