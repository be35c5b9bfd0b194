//! Frame sources.
//!
//! - Synthetic sky scenes (`stub://` URLs) for demos and tests
//! - Scripted frame/failure sequences (tests, replays)
//! - USB/V4L2 devices (feature: ingest-v4l2)
//!
//! A source buffers at most one frame. Callers that need history keep frames
//! themselves. `read` blocks for at most the configured read timeout.

mod normalize;
pub mod scripted;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use scripted::{ScriptedSource, SourceTally, SourceStep};
pub use synthetic::{SyntheticConfig, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Config, V4l2Source};

use crate::config::CameraSettings;
use crate::error::CameraError;
use crate::frame::Frame;

/// Counters every source keeps.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub read_failures: u64,
}

/// A camera handle.
pub trait FrameSource: Send {
    /// Human-readable identifier (URL or device path) for logs.
    fn describe(&self) -> String;

    /// Acquire the device. Calling `open` on an open source reopens it.
    fn open(&mut self) -> Result<(), CameraError>;

    /// Next frame, waiting at most the source's read timeout.
    fn read(&mut self) -> Result<Frame, CameraError>;

    /// Release the device. Idempotent.
    fn close(&mut self);

    fn stats(&self) -> SourceStats;
}

/// Select a source implementation for the configured camera URL.
///
/// - `stub://<name>` → `SyntheticSource`
/// - `/dev/videoN` or `v4l2:///dev/videoN` → `V4l2Source` (feature `ingest-v4l2`)
pub fn open_source(settings: &CameraSettings) -> Result<Box<dyn FrameSource>, CameraError> {
    let url = settings.url.trim();
    if url.starts_with("stub://") {
        let config = SyntheticConfig {
            name: url.to_string(),
            width: settings.width,
            height: settings.height,
            target_fps: settings.target_fps,
            ..SyntheticConfig::default()
        };
        return Ok(Box::new(SyntheticSource::new(config)));
    }

    let device = url.strip_prefix("v4l2://").unwrap_or(url);
    if device.starts_with("/dev/") {
        return v4l2_source(device, settings);
    }

    Err(CameraError::Configuration(format!(
        "unsupported camera url '{}' (expected stub://<name> or /dev/videoN)",
        url
    )))
}

#[cfg(feature = "ingest-v4l2")]
fn v4l2_source(
    device: &str,
    settings: &CameraSettings,
) -> Result<Box<dyn FrameSource>, CameraError> {
    Ok(Box::new(V4l2Source::new(V4l2Config {
        device: device.to_string(),
        target_fps: settings.target_fps,
        width: settings.width,
        height: settings.height,
        read_timeout: settings.read_timeout,
    })))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn v4l2_source(
    device: &str,
    _settings: &CameraSettings,
) -> Result<Box<dyn FrameSource>, CameraError> {
    Err(CameraError::Configuration(format!(
        "camera {} requires the ingest-v4l2 feature",
        device
    )))
}
