//! Inference: detector backends and the adapter the capture loop calls.

mod adapter;
mod backend;
mod backends;
mod result;

pub use adapter::InferenceAdapter;
pub use backend::DetectorBackend;
pub use backends::{ScriptStep, ScriptedBackend, SilhouetteBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use result::{BBox, Candidate};

use crate::config::DetectorSettings;
use crate::error::EngineError;

/// Build the adapter described by `settings`.
///
/// Unknown backend names and missing model files are configuration errors: the engine
/// cannot start without a usable detector.
pub fn adapter_from_settings(settings: &DetectorSettings) -> Result<InferenceAdapter, EngineError> {
    let backend: Box<dyn DetectorBackend> = match settings.backend.as_str() {
        "silhouette" => Box::new(SilhouetteBackend::new()),
        "tract" => tract_backend(settings)?,
        other => {
            return Err(EngineError::Configuration(format!(
                "unknown detector backend '{}'",
                other
            )))
        }
    };
    log::info!(
        "detector: backend={} threshold={:.2}",
        backend.name(),
        settings.confidence_threshold
    );
    Ok(InferenceAdapter::new(backend, settings.confidence_threshold))
}

#[cfg(feature = "backend-tract")]
fn tract_backend(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>, EngineError> {
    let path = settings.model_path.as_ref().ok_or_else(|| {
        EngineError::Configuration("tract backend requires detector.model_path".into())
    })?;
    if !path.is_file() {
        return Err(EngineError::Configuration(format!(
            "model file not found at '{}'",
            path.display()
        )));
    }
    let backend = TractBackend::new(path, settings.input_size)
        .map_err(|e| EngineError::Configuration(format!("{:#}", e)))?
        .with_nms_iou(settings.nms_iou);
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn tract_backend(_settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>, EngineError> {
    Err(EngineError::Configuration(
        "tract detector requires the backend-tract feature".into(),
    ))
}
