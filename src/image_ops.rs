use crate::mask_rcnn::bbox::BBox;
use crate::utils::tensor_to_vec;
use anyhow::Result;
use image::{imageops, imageops::FilterType, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use std::collections::HashMap;
use tch::{Kind, Tensor};

pub const IGNORE_INDEX: u8 = 255;
const MASK_ON: Luma<u8> = Luma([255]);

lazy_static! {
    static ref VOC_PALETTE_INDEX: HashMap<[u8; 3], u8> = {
        let mut m = HashMap::new();
        for index in 0..=255u8 {
            m.insert(voc_colormap(index as usize).0, index);
        }
        m
    };
}

/// Colour of a label in the PASCAL VOC palette.
pub fn voc_colormap(index: usize) -> Rgb<u8> {
    let (mut r, mut g, mut b) = (0u8, 0u8, 0u8);
    let mut cid = index;
    for j in 0..8 {
        r |= ((cid & 1) as u8) << (7 - j);
        g |= (((cid >> 1) & 1) as u8) << (7 - j);
        b |= (((cid >> 2) & 1) as u8) << (7 - j);
        cid >>= 3;
    }
    Rgb([r, g, b])
}

/// Maps an expanded VOC palette image back to its palette indices.
/// Colours outside the palette are treated as the ignore label.
pub fn decode_voc_palette(image: &RgbImage) -> Vec<u8> {
    image
        .pixels()
        .map(|p| *VOC_PALETTE_INDEX.get(&p.0).unwrap_or(&IGNORE_INDEX))
        .collect()
}

/// Scale that brings the shorter side to `min_size` unless that would push the
/// longer side past `max_size`.
pub fn compute_scale(height: u32, width: u32, min_size: u32, max_size: u32) -> f64 {
    let (short, long) = (height.min(width) as f64, height.max(width) as f64);
    let mut scale = min_size as f64 / short;
    if long * scale > max_size as f64 {
        scale = max_size as f64 / long;
    }
    scale
}

/// Side length after resizing by `scale`, rounded to the nearest pixel.
pub fn scaled_size(size: u32, scale: f64) -> u32 {
    ((size as f64 * scale).round() as u32).max(1)
}

/// Resizes the image by `scale` and lays it out as a mean-subtracted
/// `(3, H, W)` float tensor.
pub fn image_to_input_tensor(image: &RgbImage, scale: f64, mean: [f32; 3]) -> Tensor {
    let new_height = scaled_size(image.height(), scale);
    let new_width = scaled_size(image.width(), scale);
    let resized = if new_height == image.height() && new_width == image.width() {
        image.clone()
    } else {
        imageops::resize(image, new_width, new_height, FilterType::Triangle)
    };
    let plane = (new_height * new_width) as usize;
    let mut values = vec![0f32; 3 * plane];
    for (n, pixel) in resized.pixels().enumerate() {
        for c in 0..3 {
            values[c * plane + n] = pixel.0[c] as f32 - mean[c];
        }
    }
    Tensor::from_slice(&values).view([3, new_height as i64, new_width as i64])
}

/// Resizes an `(M, M)` mask probability map into `bbox` and thresholds it
/// into an image-sized binary mask.
pub fn paste_mask(
    probs: &Tensor,
    bbox: &BBox,
    height: u32,
    width: u32,
    thresh: f32,
) -> Result<GrayImage> {
    let mut mask = GrayImage::new(width, height);
    let y1 = num_traits::clamp(bbox.y_min.round() as i64, 0, height as i64) as u32;
    let x1 = num_traits::clamp(bbox.x_min.round() as i64, 0, width as i64) as u32;
    let y2 = num_traits::clamp(bbox.y_max.round() as i64, 0, height as i64) as u32;
    let x2 = num_traits::clamp(bbox.x_max.round() as i64, 0, width as i64) as u32;
    if y2 <= y1 || x2 <= x1 {
        return Ok(mask);
    }
    let (mask_h, mask_w) = probs.size2()?;
    let (box_h, box_w) = ((y2 - y1) as i64, (x2 - x1) as i64);
    let resized = probs
        .to_kind(Kind::Float)
        .reshape([1, 1, mask_h, mask_w])
        .upsample_bilinear2d([box_h, box_w], false, None::<f64>, None::<f64>);
    for (n, &prob) in tensor_to_vec(&resized)?.iter().enumerate() {
        if prob > thresh {
            let y = y1 + (n as i64 / box_w) as u32;
            let x = x1 + (n as i64 % box_w) as u32;
            mask.put_pixel(x, y, MASK_ON);
        }
    }
    Ok(mask)
}

/// Tight box around the non-zero pixels of a mask, in the
/// `(y_min, x_min, y_max + 1, x_max + 1)` convention.
pub fn mask_to_bbox(mask: &GrayImage) -> Option<BBox> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, pixel) in mask.enumerate_pixels() {
        if pixel.0[0] == 0 {
            continue;
        }
        bounds = Some(match bounds {
            None => (y, x, y, x),
            Some((y0, x0, y1, x1)) => (y0.min(y), x0.min(x), y1.max(y), x1.max(x)),
        });
    }
    bounds.map(|(y0, x0, y1, x1)| {
        BBox::new(y0 as f32, x0 as f32, (y1 + 1) as f32, (x1 + 1) as f32)
    })
}

/// Places images next to each other, top aligned, on a black canvas.
pub fn hconcat(images: &[RgbImage]) -> RgbImage {
    let width = images.iter().map(|i| i.width()).sum();
    let height = images.iter().map(|i| i.height()).max().unwrap_or(0);
    let mut canvas = RgbImage::new(width, height);
    let mut x = 0;
    for image in images {
        imageops::replace(&mut canvas, image, x as i64, 0);
        x += image.width();
    }
    canvas
}

/// Arranges images into a grid with `ceil(sqrt(n))` columns. Every cell has the
/// size of the largest image and holds its image centred on black.
pub fn tile_images(images: &[RgbImage]) -> RgbImage {
    if images.is_empty() {
        return RgbImage::new(0, 0);
    }
    let cols = (images.len() as f64).sqrt().ceil() as u32;
    let rows = (images.len() as u32 + cols - 1) / cols;
    let cell_w = images.iter().map(|i| i.width()).max().unwrap_or(0);
    let cell_h = images.iter().map(|i| i.height()).max().unwrap_or(0);
    let mut canvas: RgbImage = ImageBuffer::new(cell_w * cols, cell_h * rows);
    for (n, image) in images.iter().enumerate() {
        let (row, col) = (n as u32 / cols, n as u32 % cols);
        let x = col * cell_w + (cell_w - image.width()) / 2;
        let y = row * cell_h + (cell_h - image.height()) / 2;
        imageops::replace(&mut canvas, image, x as i64, y as i64);
    }
    canvas
}
