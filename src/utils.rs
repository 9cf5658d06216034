use tracing::info;

use crate::capture::device::{CaptureBackend, DeviceId};
use crate::capture::synthetic::{SyntheticBackend, SyntheticOptions};
use crate::error::OpenError;
use crate::{BackendKind, CaptureConfig};

/// Build the capture backend selected in `config`
pub fn open_backend(config: &CaptureConfig) -> Result<Box<dyn CaptureBackend>, OpenError> {
    match config.backend {
        BackendKind::Synthetic => Ok(Box::new(SyntheticBackend::new(SyntheticOptions {
            devices: config.synthetic_devices,
            native_fps: config.synthetic_fps,
            ..SyntheticOptions::default()
        }))),
        #[cfg(feature = "v4l2")]
        BackendKind::V4l2 => Ok(Box::new(crate::capture::v4l2::V4l2Backend {
            format: config.format,
            buffer_count: config.buffer_count,
            grab_timeout: std::time::Duration::from_millis(config.grab_timeout_ms),
        })),
        #[cfg(not(feature = "v4l2"))]
        BackendKind::V4l2 => Err(OpenError::Unavailable(
            "v4l2".into(),
            "built without the `v4l2` feature".into(),
        )),
    }
}

/// Whether `device` asks for auto-detection (`""` or `"auto"`)
pub fn is_auto(device: &DeviceId) -> bool {
    matches!(device, DeviceId::Path(p) if p.is_empty() || p.eq_ignore_ascii_case("auto"))
}

/// Resolve an auto-detect request to the first enumerated device
pub fn auto_detect_device(
    backend: &dyn CaptureBackend,
    device: &DeviceId,
) -> Result<DeviceId, OpenError> {
    if !is_auto(device) {
        return Ok(device.clone());
    }

    info!("Auto-detecting capture devices...");
    let (name, id) = backend.enumerate().into_iter().next().ok_or_else(|| {
        OpenError::Unavailable("auto".into(), "no suitable capture device found".into())
    })?;
    info!("Found device: {} ({})", name, id);
    Ok(id)
}
