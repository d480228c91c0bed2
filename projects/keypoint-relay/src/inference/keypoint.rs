use super::KeypointEngine;
use crate::pipeline::types::NormalizedKeypoint;
use anyhow::{Context, Result};
use image::RgbImage;
use ndarray::Array4;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;

/// Keypoint regressor over an ONNX model whose first output is a flat list
/// of normalized `(x, y)` pairs.
pub struct OnnxKeypointRegressor {
    session: Session,
    input_size: (u32, u32),
    keypoint_count: usize,
}

impl OnnxKeypointRegressor {
    pub fn new(model_path: &str, input_size: (u32, u32), keypoint_count: usize) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load keypoint model {}", model_path))?;
        tracing::info!(
            "OnnxKeypointRegressor: loaded {} (input {}x{}, {} keypoints)",
            model_path,
            input_size.0,
            input_size.1,
            keypoint_count
        );
        Ok(Self {
            session,
            input_size,
            keypoint_count,
        })
    }
}

/// RGB HWC u8 into NCHW f32 scaled to [0, 1].
fn to_nchw(image: &RgbImage) -> Array4<f32> {
    let (w, h) = image.dimensions();
    let mut input = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    input
}

fn pairs_to_keypoints(values: &[f32], limit: usize) -> Vec<NormalizedKeypoint> {
    values
        .chunks_exact(2)
        .take(limit)
        .map(|p| NormalizedKeypoint { x: p[0], y: p[1] })
        .collect()
}

impl KeypointEngine for OnnxKeypointRegressor {
    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    fn infer(&mut self, input: &RgbImage) -> Result<Vec<NormalizedKeypoint>> {
        let input_tensor = Tensor::from_array(to_nchw(input))?;
        let outputs = self
            .session
            .run(ort::inputs![input_tensor])
            .context("Keypoint inference failed")?;
        let output: ndarray::ArrayViewD<f32> = outputs[0]
            .try_extract_array()
            .context("Failed to extract keypoint output")?;

        let values: Vec<f32> = output.iter().copied().collect();
        let keypoints = pairs_to_keypoints(&values, self.keypoint_count);
        if keypoints.len() < self.keypoint_count {
            anyhow::bail!(
                "Keypoint model produced {} values, expected {} pairs",
                values.len(),
                self.keypoint_count
            );
        }
        Ok(keypoints)
    }
}
