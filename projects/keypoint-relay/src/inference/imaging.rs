use super::CropResizer;
use crate::pipeline::types::Roi;
use anyhow::Result;
use image::imageops::{self, FilterType};
use image::RgbImage;

/// CPU crop/resize backed by the `image` crate.
#[derive(Debug, Clone, Copy)]
pub struct ImageCropResizer {
    filter: FilterType,
}

impl Default for ImageCropResizer {
    fn default() -> Self {
        Self {
            filter: FilterType::Triangle,
        }
    }
}

impl CropResizer for ImageCropResizer {
    fn resize(&self, frame: &RgbImage, size: (u32, u32)) -> Result<RgbImage> {
        if size.0 == 0 || size.1 == 0 {
            anyhow::bail!("Invalid resize target: {}x{}", size.0, size.1);
        }
        if frame.dimensions() == size {
            return Ok(frame.clone());
        }
        Ok(imageops::resize(frame, size.0, size.1, self.filter))
    }

    fn crop_resize(&self, frame: &RgbImage, roi: &Roi, size: (u32, u32)) -> Result<RgbImage> {
        let (width, height) = frame.dimensions();

        let x = roi.x0.clamp(0, width as i32);
        let y = roi.y0.clamp(0, height as i32);
        // Corners are inclusive.
        let w = (roi.x1 - x + 1).clamp(0, width as i32 - x);
        let h = (roi.y1 - y + 1).clamp(0, height as i32 - y);

        if w <= 0 || h <= 0 {
            anyhow::bail!(
                "Invalid crop dimensions: {}x{} (roi: {:?}, frame: {}x{})",
                w,
                h,
                roi,
                width,
                height
            );
        }

        let cropped = imageops::crop_imm(frame, x as u32, y as u32, w as u32, h as u32).to_image();
        self.resize(&cropped, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_crop_resize_selects_roi_pixels() {
        // Left half red, right half blue.
        let frame = RgbImage::from_fn(200, 100, |x, _| {
            if x < 100 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        });
        let resizer = ImageCropResizer {
            filter: FilterType::Nearest,
        };

        let roi = Roi {
            x0: 120,
            y0: 10,
            x1: 179,
            y1: 69,
        };
        let out = resizer.crop_resize(&frame, &roi, (32, 32)).unwrap();
        assert_eq!(out.dimensions(), (32, 32));
        assert!(out.pixels().all(|p| *p == Rgb([0, 0, 255])));
    }

    #[test]
    fn test_crop_resize_rejects_roi_outside_frame() {
        let frame = RgbImage::new(64, 64);
        let roi = Roi {
            x0: 70,
            y0: 0,
            x1: 90,
            y1: 10,
        };
        assert!(ImageCropResizer::default()
            .crop_resize(&frame, &roi, (16, 16))
            .is_err());
    }

    #[test]
    fn test_resize_to_detector_input() {
        let frame = RgbImage::new(1920, 1080);
        let out = ImageCropResizer::default().resize(&frame, (416, 416)).unwrap();
        assert_eq!(out.dimensions(), (416, 416));
        assert!(ImageCropResizer::default().resize(&frame, (0, 416)).is_err());
    }
}
