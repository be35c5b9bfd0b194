pub mod scripted;
pub mod silhouette;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use scripted::{ScriptStep, ScriptedBackend};
pub use silhouette::SilhouetteBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
