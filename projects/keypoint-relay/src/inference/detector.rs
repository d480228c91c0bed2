use super::ObjectDetector;
use crate::pipeline::types::Detection;
use anyhow::Result;
use image::{DynamicImage, RgbImage};
use std::collections::BTreeMap;
use usls::models::RTDETR;
use usls::{Config, Image};

/// A wrapper around the USLS RT-DETR model that groups detections by class
/// and corrects for aspect-ratio padding bugs in the underlying model library.
pub struct UslsDetector {
    model: RTDETR,
    input_size: (u32, u32),
    min_confidence: f32,
}

impl UslsDetector {
    /// Create a new detector with the given model path.
    pub fn new(model_path: &str, input_size: (u32, u32), min_confidence: f32) -> Result<Self> {
        let config = Config::default().with_model_file(model_path);

        #[cfg(target_os = "macos")]
        let config = config.with_model_device(usls::Device::CoreMl);

        let config = config.commit()?;
        let model = RTDETR::new(config)?;
        tracing::info!(
            "UslsDetector: loaded {} (input {}x{}, min confidence {})",
            model_path,
            input_size.0,
            input_size.1,
            min_confidence
        );
        Ok(Self {
            model,
            input_size,
            min_confidence,
        })
    }
}

impl ObjectDetector for UslsDetector {
    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    fn detect(&mut self, input: &RgbImage) -> Result<Vec<Vec<Detection>>> {
        let (img_w, img_h) = (input.width() as f32, input.height() as f32);

        // Correction calculations (USLS RT-DETR bug workaround)
        let (x_corr, y_corr) = if img_w > img_h {
            (img_w / img_h, 1.0)
        } else if img_h > img_w {
            (1.0, img_h / img_w)
        } else {
            (1.0, 1.0)
        };

        let image = Image::from(DynamicImage::ImageRgb8(input.clone()));
        let results = self.model.forward(&[image])?;

        let mut groups: BTreeMap<usize, Vec<Detection>> = BTreeMap::new();
        for y in results {
            for hbb in y.hbbs {
                let confidence = hbb.confidence().unwrap_or(0.0);
                if confidence < self.min_confidence {
                    continue;
                }
                let x0 = hbb.xmin() * x_corr;
                let y0 = hbb.ymin() * y_corr;
                let class_id = hbb.id().unwrap_or(0);
                groups.entry(class_id).or_default().push(Detection::new(
                    class_id,
                    confidence,
                    x0,
                    y0,
                    x0 + hbb.width() * x_corr,
                    y0 + hbb.height() * y_corr,
                ));
            }
        }

        Ok(groups.into_values().collect())
    }
}
