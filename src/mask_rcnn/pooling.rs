//! Region of interest feature extraction.
//!
//! All three operators crop a box out of a `(C, H, W)` feature map and bring it
//! to a fixed `out x out` grid; they differ in how the grid is sampled.
//! Boxes are given in input image coordinates and mapped onto the feature map
//! with `spatial_scale`. The output is laid out as `(R, C, out, out)`.

use super::bbox::BBox;
use crate::utils::tensor_to_vec;
use anyhow::{anyhow, Result};
use rayon::prelude::*;
use std::fmt;
use std::str::FromStr;
use tch::Tensor;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PoolingFunc {
    /// Bilinear sampling averaged over an adaptive grid per bin.
    Align,
    /// Max over each quantized bin.
    Pooling,
    /// Bilinear resize of the box corners to the output grid.
    Resize,
}

impl FromStr for PoolingFunc {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "align" => Ok(PoolingFunc::Align),
            "pooling" => Ok(PoolingFunc::Pooling),
            "resize" => Ok(PoolingFunc::Resize),
            other => Err(anyhow!(
                "Unsupported pooling_func {:?} (expected one of: align, pooling, resize)",
                other
            )),
        }
    }
}

impl fmt::Display for PoolingFunc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PoolingFunc::Align => "roi_align_2d",
            PoolingFunc::Pooling => "roi_pooling_2d",
            PoolingFunc::Resize => "crop_and_resize",
        };
        write!(f, "{}", name)
    }
}

/// Host copy of a single image feature map.
#[derive(Debug)]
pub struct FeatureMap {
    pub data: Vec<f32>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl FeatureMap {
    /// Copies a `(1, C, H, W)` or `(C, H, W)` tensor to the host.
    pub fn from_tensor(features: &Tensor) -> Result<Self> {
        let size = features.size();
        let (channels, height, width) = match size.as_slice() {
            [1, c, h, w] | [c, h, w] => (*c as usize, *h as usize, *w as usize),
            _ => return Err(anyhow!("Unexpected feature map shape {:?}", size)),
        };
        Ok(Self {
            data: tensor_to_vec(features)?,
            channels,
            height,
            width,
        })
    }

    fn plane(&self, channel: usize) -> &[f32] {
        let size = self.height * self.width;
        &self.data[channel * size..(channel + 1) * size]
    }
}

impl PoolingFunc {
    pub fn apply(
        &self,
        features: &FeatureMap,
        rois: &[BBox],
        out: usize,
        spatial_scale: f32,
    ) -> Vec<f32> {
        let roi_len = features.channels * out * out;
        let mut output = vec![0f32; rois.len() * roi_len];
        if roi_len == 0 {
            return output;
        }
        output
            .par_chunks_mut(roi_len)
            .zip(rois.par_iter())
            .for_each(|(dst, roi)| match self {
                PoolingFunc::Align => roi_align_2d(features, roi, out, spatial_scale, dst),
                PoolingFunc::Pooling => roi_pooling_2d(features, roi, out, spatial_scale, dst),
                PoolingFunc::Resize => crop_and_resize(features, roi, out, spatial_scale, dst),
            });
        output
    }
}

fn roi_pooling_2d(features: &FeatureMap, roi: &BBox, out: usize, scale: f32, dst: &mut [f32]) {
    let (h, w) = (features.height as i64, features.width as i64);
    let start_h = (roi.y_min * scale).round() as i64;
    let start_w = (roi.x_min * scale).round() as i64;
    let end_h = (roi.y_max * scale).round() as i64;
    let end_w = (roi.x_max * scale).round() as i64;
    let bin_h = (end_h - start_h + 1).max(1) as f32 / out as f32;
    let bin_w = (end_w - start_w + 1).max(1) as f32 / out as f32;

    for c in 0..features.channels {
        let plane = features.plane(c);
        for ph in 0..out {
            let h_start = num_traits::clamp((ph as f32 * bin_h).floor() as i64 + start_h, 0, h);
            let h_end =
                num_traits::clamp(((ph + 1) as f32 * bin_h).ceil() as i64 + start_h, 0, h);
            for pw in 0..out {
                let w_start =
                    num_traits::clamp((pw as f32 * bin_w).floor() as i64 + start_w, 0, w);
                let w_end =
                    num_traits::clamp(((pw + 1) as f32 * bin_w).ceil() as i64 + start_w, 0, w);
                let value = if h_end <= h_start || w_end <= w_start {
                    0.
                } else {
                    let mut max = f32::NEG_INFINITY;
                    for y in h_start..h_end {
                        for x in w_start..w_end {
                            max = max.max(plane[(y * w + x) as usize]);
                        }
                    }
                    max
                };
                dst[(c * out + ph) * out + pw] = value;
            }
        }
    }
}

/// Bilinear interpolation that treats samples up to one pixel outside the map
/// as lying on its border, and anything further away as zero.
fn bilinear_interpolate(plane: &[f32], height: usize, width: usize, y: f32, x: f32) -> f32 {
    if y < -1. || y > height as f32 || x < -1. || x > width as f32 {
        return 0.;
    }
    let (mut y, mut x) = (y.max(0.), x.max(0.));
    let mut y_low = y as usize;
    let y_high = if y_low >= height - 1 {
        y_low = height - 1;
        y = y_low as f32;
        y_low
    } else {
        y_low + 1
    };
    let mut x_low = x as usize;
    let x_high = if x_low >= width - 1 {
        x_low = width - 1;
        x = x_low as f32;
        x_low
    } else {
        x_low + 1
    };
    let (ly, lx) = (y - y_low as f32, x - x_low as f32);
    let (hy, hx) = (1. - ly, 1. - lx);
    hy * hx * plane[y_low * width + x_low]
        + hy * lx * plane[y_low * width + x_high]
        + ly * hx * plane[y_high * width + x_low]
        + ly * lx * plane[y_high * width + x_high]
}

fn roi_align_2d(features: &FeatureMap, roi: &BBox, out: usize, scale: f32, dst: &mut [f32]) {
    let start_h = roi.y_min * scale;
    let start_w = roi.x_min * scale;
    let roi_h = (roi.y_max * scale - start_h).max(1.);
    let roi_w = (roi.x_max * scale - start_w).max(1.);
    let bin_h = roi_h / out as f32;
    let bin_w = roi_w / out as f32;
    let grid_h = bin_h.ceil().max(1.) as usize;
    let grid_w = bin_w.ceil().max(1.) as usize;
    let count = (grid_h * grid_w) as f32;

    for c in 0..features.channels {
        let plane = features.plane(c);
        for ph in 0..out {
            for pw in 0..out {
                let mut sum = 0.;
                for iy in 0..grid_h {
                    let y = start_h
                        + ph as f32 * bin_h
                        + (iy as f32 + 0.5) * bin_h / grid_h as f32;
                    for ix in 0..grid_w {
                        let x = start_w
                            + pw as f32 * bin_w
                            + (ix as f32 + 0.5) * bin_w / grid_w as f32;
                        sum += bilinear_interpolate(plane, features.height, features.width, y, x);
                    }
                }
                dst[(c * out + ph) * out + pw] = sum / count;
            }
        }
    }
}

fn crop_and_resize(features: &FeatureMap, roi: &BBox, out: usize, scale: f32, dst: &mut [f32]) {
    let (height, width) = (features.height, features.width);
    let (y1, x1) = (roi.y_min * scale, roi.x_min * scale);
    let (y2, x2) = (roi.y_max * scale, roi.x_max * scale);
    let sample = |start: f32, end: f32, i: usize| {
        if out > 1 {
            start + i as f32 * (end - start) / (out - 1) as f32
        } else {
            0.5 * (start + end)
        }
    };

    for c in 0..features.channels {
        let plane = features.plane(c);
        for ph in 0..out {
            let y = sample(y1, y2, ph);
            for pw in 0..out {
                let x = sample(x1, x2, pw);
                let idx = (c * out + ph) * out + pw;
                if y < 0. || y > (height - 1) as f32 || x < 0. || x > (width - 1) as f32 {
                    dst[idx] = 0.;
                    continue;
                }
                let (top, left) = (y.floor() as usize, x.floor() as usize);
                let (bottom, right) = (y.ceil() as usize, x.ceil() as usize);
                let (ly, lx) = (y - top as f32, x - left as f32);
                let top_value = plane[top * width + left]
                    + (plane[top * width + right] - plane[top * width + left]) * lx;
                let bottom_value = plane[bottom * width + left]
                    + (plane[bottom * width + right] - plane[bottom * width + left]) * lx;
                dst[idx] = top_value + (bottom_value - top_value) * ly;
            }
        }
    }
}
