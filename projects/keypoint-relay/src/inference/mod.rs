// Model runners and image preparation used by the result worker.

#[cfg(feature = "onnx")]
pub mod detector;
pub mod imaging;
#[cfg(feature = "onnx")]
pub mod keypoint;

use crate::pipeline::types::{Detection, NormalizedKeypoint, Roi};
use anyhow::Result;
use image::RgbImage;

/// Object localization model.
pub trait ObjectDetector: Send {
    /// `(width, height)` the model expects; frames are resized to it first.
    fn input_size(&self) -> (u32, u32);

    /// Detections grouped by origin, in input-image pixel coordinates.
    fn detect(&mut self, input: &RgbImage) -> Result<Vec<Vec<Detection>>>;
}

/// Landmark regression model run on a cropped region.
pub trait KeypointEngine: Send {
    fn input_size(&self) -> (u32, u32);

    /// Keypoints normalized to the input image, in model output order.
    fn infer(&mut self, input: &RgbImage) -> Result<Vec<NormalizedKeypoint>>;
}

pub trait CropResizer: Send + Sync {
    fn resize(&self, frame: &RgbImage, size: (u32, u32)) -> Result<RgbImage>;

    /// Crops the inclusive `roi` out of `frame` and resizes it to `size`.
    fn crop_resize(&self, frame: &RgbImage, roi: &Roi, size: (u32, u32)) -> Result<RgbImage>;
}
