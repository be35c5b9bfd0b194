use std::cmp::Ordering;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Candidate;
use crate::error::InferenceError;
use crate::frame::Frame;

/// Wraps a backend with frame validation, confidence filtering and ordering.
pub struct InferenceAdapter {
    backend: Box<dyn DetectorBackend>,
    confidence_threshold: f32,
}

impl InferenceAdapter {
    pub fn new(backend: Box<dyn DetectorBackend>, confidence_threshold: f32) -> Self {
        Self {
            backend,
            confidence_threshold,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    pub fn warm_up(&mut self) -> Result<(), InferenceError> {
        self.backend.warm_up()
    }

    /// Candidates with confidence `>=` the threshold, highest confidence first.
    ///
    /// Equal confidences are ordered by box position (top-left first) so the output
    /// depends only on the frame and the model.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<Candidate>, InferenceError> {
        if !frame.is_well_formed() {
            return Err(InferenceError::MalformedFrame(format!(
                "expected {}x{} RGB24 ({:?} bytes), received {} bytes",
                frame.width,
                frame.height,
                Frame::expected_len(frame.width, frame.height),
                frame.pixels().len()
            )));
        }

        let raw = self
            .backend
            .detect(frame.pixels(), frame.width, frame.height)?;

        let mut candidates: Vec<Candidate> = raw
            .into_iter()
            .filter(|c| c.confidence.is_finite() && c.bbox.is_finite())
            .filter(|c| c.confidence >= self.confidence_threshold)
            .filter_map(|c| {
                c.bbox.clamp_to(frame.width, frame.height).map(|bbox| Candidate {
                    bbox,
                    confidence: c.confidence.min(1.0),
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.bbox.y1.total_cmp(&b.bbox.y1))
                .then_with(|| a.bbox.x1.total_cmp(&b.bbox.x1))
        });
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::ScriptedBackend;
    use crate::detect::BBox;
    use chrono::Local;

    fn frame() -> Frame {
        Frame::filled(100, 100, [255, 255, 255], Local::now(), 1)
    }

    fn adapter(script: Vec<Vec<Candidate>>) -> InferenceAdapter {
        InferenceAdapter::new(Box::new(ScriptedBackend::new(script)), 0.5)
    }

    #[test]
    fn filters_below_threshold_and_sorts_descending() {
        let mut adapter = adapter(vec![vec![
            Candidate::new(BBox::new(0.0, 0.0, 10.0, 10.0), 0.6),
            Candidate::new(BBox::new(20.0, 0.0, 30.0, 10.0), 0.49),
            Candidate::new(BBox::new(40.0, 0.0, 50.0, 10.0), 0.9),
            Candidate::new(BBox::new(60.0, 0.0, 70.0, 10.0), 0.5),
        ]]);

        let out = adapter.detect(&frame()).unwrap();
        let confidences: Vec<f32> = out.iter().map(|c| c.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.6, 0.5]);
    }

    #[test]
    fn ties_are_broken_by_position() {
        let mut adapter = adapter(vec![vec![
            Candidate::new(BBox::new(60.0, 10.0, 70.0, 20.0), 0.8),
            Candidate::new(BBox::new(10.0, 10.0, 20.0, 20.0), 0.8),
        ]]);
        let out = adapter.detect(&frame()).unwrap();
        assert_eq!(out[0].bbox.x1, 10.0);
        assert_eq!(out[1].bbox.x1, 60.0);
    }

    #[test]
    fn drops_non_finite_and_off_frame_boxes() {
        let mut adapter = adapter(vec![vec![
            Candidate::new(BBox::new(f32::NAN, 0.0, 10.0, 10.0), 0.9),
            Candidate::new(BBox::new(0.0, 0.0, 10.0, 10.0), f32::INFINITY),
            Candidate::new(BBox::new(150.0, 150.0, 160.0, 160.0), 0.9),
            Candidate::new(BBox::new(90.0, 90.0, 120.0, 120.0), 0.7),
        ]]);
        let out = adapter.detect(&frame()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bbox, BBox::new(90.0, 90.0, 100.0, 100.0));
    }

    #[test]
    fn malformed_frame_is_rejected_before_backend() {
        let mut adapter = adapter(vec![vec![Candidate::new(
            BBox::new(0.0, 0.0, 10.0, 10.0),
            0.9,
        )]]);
        let bad = Frame::new(vec![0u8; 7], 100, 100, Local::now(), 1);
        assert!(matches!(
            adapter.detect(&bad),
            Err(InferenceError::MalformedFrame(_))
        ));
        // the scripted entry was not consumed
        assert_eq!(adapter.detect(&frame()).unwrap().len(), 1);
    }
}
