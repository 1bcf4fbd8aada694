use super::{Dataset, InstanceAnnotation, InstanceSegmentationExample};
use crate::image_ops::{decode_voc_palette, mask_to_bbox, IGNORE_INDEX};
use anyhow::{anyhow, Context, Result};
use image::{GrayImage, Luma, RgbImage};
use log::{debug, info};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const VOC_DIR_ENV: &str = "MASK_RCNN_VOC_DIR";
pub const DEFAULT_VOC_DIR: &str = "data/VOCdevkit/VOC2012";

pub const VOC_CLASS_NAMES: [&str; 20] = [
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

/// Instance segmentation examples of a VOC style directory.
#[derive(Debug)]
pub struct VocInstanceSegmentationDataset {
    root: PathBuf,
    ids: Vec<String>,
}

impl VocInstanceSegmentationDataset {
    pub fn new(root: &Path, split: &str) -> Result<Self> {
        let split_file = root
            .join("ImageSets")
            .join("Segmentation")
            .join(format!("{}.txt", split));
        let ids = fs::read_to_string(&split_file)
            .with_context(|| format!("Failed to read split file {}", split_file.display()))?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect::<Vec<String>>();
        info!(
            "Loaded {} split of {} ({} images)",
            split,
            root.display(),
            ids.len()
        );
        Ok(Self {
            root: root.to_path_buf(),
            ids,
        })
    }

    /// Opens the directory named by `MASK_RCNN_VOC_DIR`, falling back to the
    /// default location.
    pub fn from_env(split: &str) -> Result<Self> {
        let root = env::var(VOC_DIR_ENV).unwrap_or_else(|_| DEFAULT_VOC_DIR.to_string());
        Self::new(Path::new(&root), split)
    }

    pub fn class_names(&self) -> &'static [&'static str] {
        &VOC_CLASS_NAMES
    }

    fn read_label_image(&self, dir: &str, id: &str) -> Result<Vec<u8>> {
        let path = self.root.join(dir).join(format!("{}.png", id));
        let image = image::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?
            .to_rgb8();
        Ok(decode_voc_palette(&image))
    }
}

/// Splits per-pixel class and instance ids into instances. Each instance
/// takes the most frequent class among its pixels.
fn instances_from_labels(
    classes: &[u8],
    objects: &[u8],
    height: u32,
    width: u32,
) -> Vec<InstanceAnnotation> {
    let mut votes: BTreeMap<u8, BTreeMap<u8, usize>> = BTreeMap::new();
    for (&class, &object) in classes.iter().zip(objects) {
        if object == 0 || object == IGNORE_INDEX || class == 0 || class == IGNORE_INDEX {
            continue;
        }
        *votes.entry(object).or_default().entry(class).or_default() += 1;
    }

    let mut instances = Vec::new();
    for (object, class_votes) in votes {
        let class = match class_votes.iter().max_by_key(|entry| *entry.1) {
            Some((&class, _)) => class,
            None => continue,
        };
        if class as usize > VOC_CLASS_NAMES.len() {
            continue;
        }
        let mut mask = GrayImage::new(width, height);
        for (n, &id) in objects.iter().enumerate() {
            if id == object {
                mask.put_pixel(n as u32 % width, n as u32 / width, Luma([255]));
            }
        }
        if let Some(bbox) = mask_to_bbox(&mask) {
            instances.push(InstanceAnnotation {
                bbox,
                mask,
                label: class as usize - 1,
            });
        }
    }
    instances
}

impl Dataset for VocInstanceSegmentationDataset {
    type Item = InstanceSegmentationExample;

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn get_example(&self, index: usize) -> Result<Self::Item> {
        let id = self
            .ids
            .get(index)
            .ok_or_else(|| anyhow!("Index {} is out of range", index))?;
        let image_path = self.root.join("JPEGImages").join(format!("{}.jpg", id));
        let image: RgbImage = image::open(&image_path)
            .with_context(|| format!("Failed to open {}", image_path.display()))?
            .to_rgb8();
        let classes = self.read_label_image("SegmentationClass", id)?;
        let objects = self.read_label_image("SegmentationObject", id)?;
        let expected = (image.width() * image.height()) as usize;
        if classes.len() != expected || objects.len() != expected {
            return Err(anyhow!("Label images of {} don't match the image size", id));
        }
        let instances = instances_from_labels(&classes, &objects, image.height(), image.width());
        debug!("{}: {} instances", id, instances.len());
        Ok(InstanceSegmentationExample { image, instances })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_ops::voc_colormap;
    use crate::mask_rcnn::bbox::BBox;

    #[test]
    fn instances_take_majority_class() {
        // 2x4 image: object 1 covers the left half, object 2 the right half,
        // the last column is the ignore border
        let classes = vec![15, 15, 12, 255, 15, 9, 12, 255];
        let objects = vec![1, 1, 2, 255, 1, 1, 2, 255];
        let instances = instances_from_labels(&classes, &objects, 2, 4);
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].label, 14);
        assert_eq!(instances[0].bbox, BBox::new(0., 0., 2., 2.));
        assert_eq!(instances[1].label, 11);
        assert_eq!(instances[1].bbox, BBox::new(0., 2., 2., 3.));
        assert_eq!(instances[1].mask.get_pixel(2, 1).0[0], 255);
        assert_eq!(instances[1].mask.get_pixel(3, 1).0[0], 0);
    }

    #[test]
    fn background_only_has_no_instances() {
        let instances = instances_from_labels(&[0, 0, 255, 0], &[0, 0, 255, 0], 2, 2);
        assert!(instances.is_empty());
    }

    fn palette_image(indices: &[u8], width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            voc_colormap(indices[(y * width + x) as usize] as usize)
        })
    }

    #[test]
    fn reads_voc_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        for sub in &[
            "ImageSets/Segmentation",
            "JPEGImages",
            "SegmentationClass",
            "SegmentationObject",
        ] {
            fs::create_dir_all(root.join(sub))?;
        }
        fs::write(root.join("ImageSets/Segmentation/val.txt"), "2007_000001\n\n")?;
        RgbImage::from_pixel(4, 3, image::Rgb([90, 90, 90]))
            .save(root.join("JPEGImages/2007_000001.jpg"))?;
        let classes = [0, 8, 8, 0, 0, 8, 8, 0, 0, 0, 0, 255];
        let objects = [0, 1, 1, 0, 0, 1, 1, 0, 0, 0, 0, 255];
        palette_image(&classes, 4, 3).save(root.join("SegmentationClass/2007_000001.png"))?;
        palette_image(&objects, 4, 3).save(root.join("SegmentationObject/2007_000001.png"))?;

        let dataset = VocInstanceSegmentationDataset::new(root, "val")?;
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.class_names().len(), 20);
        let example = dataset.get_example(0)?;
        assert_eq!(example.image.dimensions(), (4, 3));
        assert_eq!(example.instances.len(), 1);
        assert_eq!(example.instances[0].label, 7);
        assert_eq!(example.instances[0].bbox, BBox::new(0., 1., 2., 3.));
        assert!(dataset.get_example(1).is_err());
        assert!(VocInstanceSegmentationDataset::new(root, "train").is_err());
        Ok(())
    }
}
