#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BBox, Candidate};
use crate::error::InferenceError;

/// Tract-based backend for a single-class YOLOv8 ONNX export.
///
/// The model takes `1x3xSxS` RGB in 0..1 and returns `1x5xN` rows of
/// `(cx, cy, w, h, score)` in model-input pixels. Frames are resized to the model input
/// and boxes scaled back to frame coordinates. Overlapping boxes are suppressed with
/// greedy NMS.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    score_floor: f32,
    nms_iou: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            score_floor: 0.05,
            nms_iou: 0.45,
        })
    }

    /// Override the NMS overlap threshold.
    pub fn with_nms_iou(mut self, nms_iou: f32) -> Self {
        self.nms_iou = nms_iou;
        self
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<Tensor> {
        let img = RgbImage::from_raw(width, height, pixels.to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", width, height))?;
        let resized = imageops::resize(&img, self.input_size, self.input_size, FilterType::Triangle);

        let size = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>, width: u32, height: u32) -> Result<Vec<Candidate>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not rank 3")?;
        let shape = view.shape().to_vec();
        if shape[0] != 1 || shape[1] < 5 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }

        let sx = width as f32 / self.input_size as f32;
        let sy = height as f32 / self.input_size as f32;
        let mut candidates = Vec::new();
        for i in 0..shape[2] {
            let score = view[[0, 4, i]];
            if score.is_nan() || score < self.score_floor {
                continue;
            }
            let bbox = BBox::from_center(
                view[[0, 0, i]] * sx,
                view[[0, 1, i]] * sy,
                view[[0, 2, i]] * sx,
                view[[0, 3, i]] * sy,
            );
            candidates.push(Candidate::new(bbox, score));
        }
        Ok(non_max_suppression(candidates, self.nms_iou))
    }
}

/// Greedy NMS: keep the best box, drop everything overlapping it above `iou`, repeat.
pub(crate) fn non_max_suppression(mut candidates: Vec<Candidate>, iou: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for cand in candidates {
        if kept.iter().all(|k| k.bbox.iou(&cand.bbox) <= iou) {
            kept.push(cand);
        }
    }
    kept
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Candidate>, InferenceError> {
        let input = self
            .build_input(pixels, width, height)
            .map_err(|e| InferenceError::MalformedFrame(e.to_string()))?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| InferenceError::Model(format!("ONNX inference failed: {}", e)))?;
        self.decode(outputs, width, height)
            .map_err(|e| InferenceError::Model(e.to_string()))
    }

    fn warm_up(&mut self) -> Result<(), InferenceError> {
        let size = self.input_size;
        let blank = vec![0u8; (size * size * 3) as usize];
        self.detect(&blank, size, size).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_keeps_best_of_overlapping_boxes() {
        let kept = non_max_suppression(
            vec![
                Candidate::new(BBox::new(0.0, 0.0, 10.0, 10.0), 0.7),
                Candidate::new(BBox::new(1.0, 1.0, 11.0, 11.0), 0.9),
                Candidate::new(BBox::new(50.0, 50.0, 60.0, 60.0), 0.6),
            ],
            0.45,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.6);
    }
}
