use super::{InstanceSegmentationExample, Transform};
use crate::image_ops::{compute_scale, image_to_input_tensor};
use crate::mask_rcnn::ModelConfig;
use anyhow::{anyhow, Result};
use tch::Tensor;

/// An example together with the tensor the network consumes.
#[derive(Debug)]
pub struct TransformedExample {
    /// `(3, H, W)` resized and mean subtracted image.
    pub input: Tensor,
    pub scale: f64,
    pub example: InstanceSegmentationExample,
}

#[derive(Debug, Clone)]
pub struct MaskRcnnTransform {
    mean: [f32; 3],
    min_size: u32,
    max_size: u32,
}

impl MaskRcnnTransform {
    pub fn new(mean: [f32; 3], min_size: u32, max_size: u32) -> Self {
        Self {
            mean,
            min_size,
            max_size,
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(config.mean, config.min_size, config.max_size)
    }
}

impl Transform<InstanceSegmentationExample> for MaskRcnnTransform {
    type Output = TransformedExample;

    fn apply(&self, example: InstanceSegmentationExample) -> Result<TransformedExample> {
        let (width, height) = example.image.dimensions();
        if width == 0 || height == 0 {
            return Err(anyhow!("Cannot transform an empty image"));
        }
        let scale = compute_scale(height, width, self.min_size, self.max_size);
        let input = image_to_input_tensor(&example.image, scale, self.mean);
        Ok(TransformedExample {
            input,
            scale,
            example,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn resizes_shorter_side() -> Result<()> {
        let transform = MaskRcnnTransform::new([0., 0., 0.], 60, 100);
        let example = InstanceSegmentationExample {
            image: RgbImage::from_pixel(40, 30, Rgb([5, 5, 5])),
            instances: Vec::new(),
        };
        let out = transform.apply(example)?;
        assert!((out.scale - 2.).abs() < f64::EPSILON);
        assert_eq!(out.input.size(), vec![3, 60, 80]);
        assert_eq!(out.example.image.dimensions(), (40, 30));

        let wide = InstanceSegmentationExample {
            image: RgbImage::from_pixel(200, 20, Rgb([5, 5, 5])),
            instances: Vec::new(),
        };
        let out = transform.apply(wide)?;
        assert!((out.scale - 0.5).abs() < f64::EPSILON);
        assert_eq!(out.input.size(), vec![3, 10, 100]);
        Ok(())
    }
}
