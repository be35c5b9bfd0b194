use crate::detect::result::Candidate;
use crate::error::InferenceError;

/// Detector backend trait.
///
/// A backend turns one RGB24 frame into candidate boxes. Implementations must be
/// deterministic for a given frame and model (no hidden randomness) and must treat the
/// pixel slice as read-only and ephemeral.
///
/// Confidence filtering and ordering are applied by `InferenceAdapter`; backends may
/// return candidates in any order.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Candidate>, InferenceError>;

    /// Optional warm-up hook, called once when the engine is built.
    fn warm_up(&mut self) -> Result<(), InferenceError> {
        Ok(())
    }
}
