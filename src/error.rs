use std::time::Duration;

use thiserror::Error;

/// Failures reported by a frame source.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Camera unavailable or disconnected. Recoverable by retrying `start()`.
    #[error("camera device error: {0}")]
    Device(String),
    /// No frame arrived within the read timeout. One frame is skipped.
    #[error("frame capture timed out after {0:?}")]
    CaptureTimeout(Duration),
    /// The configured device or URL cannot be used at all.
    #[error("camera configuration error: {0}")]
    Configuration(String),
}

/// Failures reported while running the detector on one frame.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("model failure: {0}")]
    Model(String),
}

/// Lifecycle failures surfaced synchronously by `Engine::try_start` / `Engine::try_stop`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} thread panicked")]
    WorkerPanicked(&'static str),
}
