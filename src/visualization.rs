use crate::dataset::transform::TransformedExample;
use crate::dataset::{Dataset, SerialIter};
use crate::image_ops::{hconcat, tile_images, voc_colormap};
use crate::mask_rcnn::bbox::BBox;
use crate::mask_rcnn::{InstanceSegmentationModel, Preset};
use anyhow::{Context, Result};
use image::{GrayImage, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};
use log::debug;
use std::path::PathBuf;

pub const VIS_INDICES: [usize; 9] = [196, 204, 216, 257, 326, 473, 566, 649, 1063];
pub const VIS_FILENAME: &str = "iteration=%s.jpg";

/// Where a report lands and under which iteration label.
#[derive(Debug, Clone)]
pub struct VisTarget {
    pub iteration: String,
    pub out: PathBuf,
}

/// Paints masks at half opacity and outlines boxes, coloured by label.
pub fn draw_instances(image: &RgbImage, instances: &[(BBox, &GrayImage, usize)]) -> RgbImage {
    let mut canvas = image.clone();
    for (bbox, mask, label) in instances {
        let color = voc_colormap(label + 1);
        for (x, y, pixel) in canvas.enumerate_pixels_mut() {
            if x >= mask.width() || y >= mask.height() || mask.get_pixel(x, y).0[0] == 0 {
                continue;
            }
            for c in 0..3 {
                pixel.0[c] = ((pixel.0[c] as u16 + color.0[c] as u16) / 2) as u8;
            }
        }
        let (x0, y0) = (bbox.x_min.round() as i32, bbox.y_min.round() as i32);
        let (x1, y1) = (bbox.x_max.round() as i32, bbox.y_max.round() as i32);
        if x1 > x0 && y1 > y0 {
            let rect = Rect::at(x0, y0).of_size((x1 - x0) as u32, (y1 - y0) as u32);
            draw_hollow_rect_mut(&mut canvas, rect, color);
        }
    }
    canvas
}

/// Renders ground truth next to predictions for a fixed set of examples and
/// tiles them into one image.
pub struct InstanceSegmentationVisReport<'a, D, M> {
    dataset: D,
    model: &'a M,
    class_names: &'a [&'a str],
    file_name: &'a str,
}

impl<'a, D, M> InstanceSegmentationVisReport<'a, D, M>
where
    D: Dataset<Item = TransformedExample>,
    M: InstanceSegmentationModel,
{
    /// `file_name` may hold a `%s`, replaced by the target's iteration.
    pub fn new(dataset: D, model: &'a M, class_names: &'a [&'a str], file_name: &'a str) -> Self {
        Self {
            dataset,
            model,
            class_names,
            file_name,
        }
    }

    pub fn render(&self) -> Result<RgbImage> {
        let mut panels = Vec::with_capacity(self.dataset.len());
        for batch in SerialIter::new(&self.dataset, 1, true)? {
            for example in batch? {
                let image = &example.example.image;
                let gts = example
                    .example
                    .instances
                    .iter()
                    .map(|gt| (gt.bbox, &gt.mask, gt.label))
                    .collect::<Vec<_>>();
                let detections = self.model.predict(&example, Preset::Visualize)?;
                for d in &detections {
                    debug!(
                        "{} {:.3} at {:?}",
                        self.class_names.get(d.label).unwrap_or(&"?"),
                        d.score,
                        d.bbox
                    );
                }
                let preds = detections
                    .iter()
                    .map(|d| (d.bbox, &d.mask, d.label))
                    .collect::<Vec<_>>();
                panels.push(hconcat(&[
                    draw_instances(image, &gts),
                    draw_instances(image, &preds),
                ]));
            }
        }
        Ok(tile_images(&panels))
    }

    /// Writes the report for `target` and returns the file path. The format
    /// follows the file extension.
    pub fn report(&self, target: &VisTarget) -> Result<PathBuf> {
        let path = target
            .out
            .join(self.file_name.replace("%s", &target.iteration));
        let image = self.render()?;
        image
            .save(&path)
            .with_context(|| format!("Failed to save {}", path.display()))?;
        Ok(path)
    }
}
