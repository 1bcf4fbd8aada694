pub mod bbox;
pub mod head;
pub mod pooling;
pub mod resnet;
pub mod rpn;
pub mod weights;

use crate::dataset::transform::TransformedExample;
use crate::image_ops::paste_mask;
use crate::params::Params;
use crate::utils::tensor_to_vec;
use anyhow::{anyhow, Result};
use bbox::{non_maximum_suppression, BBox};
use head::RoiHead;
use image::GrayImage;
use log::debug;
use pooling::{FeatureMap, PoolingFunc};
use regex::Regex;
use resnet::resnet_extractor;
use rpn::RegionProposalNetwork;
use std::path::Path;
use tch::{nn, nn::FuncT, nn::ModuleT, Device, Kind, Tensor};

pub const DEFAULT_ANCHOR_SCALES: [f32; 4] = [4., 8., 16., 32.];
pub const DEFAULT_MEAN: [f32; 3] = [123.152, 115.903, 103.063];
pub const DEFAULT_MIN_SIZE: u32 = 600;
pub const DEFAULT_MAX_SIZE: u32 = 1000;
pub const DEFAULT_ROI_SIZE: i64 = 7;

const ANCHOR_RATIOS: [f32; 3] = [0.5, 1., 2.];
const FEAT_STRIDE: f32 = 16.;
const EXTRACTOR_CHANNELS: i64 = 1024;
const LOC_STD: [f32; 4] = [0.1, 0.1, 0.2, 0.2];
const MASK_THRESH: f32 = 0.5;

lazy_static! {
    static ref BACKBONE_RE: Regex = Regex::new(r"^resnet(\d+)$").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub n_layers: i64,
    pub n_fg_class: usize,
    pub pooling_func: PoolingFunc,
    pub anchor_scales: Vec<f32>,
    pub mean: [f32; 3],
    pub min_size: u32,
    pub max_size: u32,
    pub roi_size: i64,
}

impl ModelConfig {
    /// Resolves the training config into a network description. The pooling
    /// function and the backbone are validated here, before anything is built.
    pub fn from_params(params: &Params, n_fg_class: usize) -> Result<Self> {
        let pooling_func = params.pooling_func.parse::<PoolingFunc>()?;
        let n_layers = BACKBONE_RE
            .captures(&params.model)
            .and_then(|caps| caps[1].parse::<i64>().ok())
            .ok_or_else(|| anyhow!("Unsupported model {:?}", params.model))?;
        resnet::block_counts(n_layers)?;
        let roi_size = params.roi_size.unwrap_or(DEFAULT_ROI_SIZE);
        if roi_size <= 0 {
            return Err(anyhow!("roi_size has to be positive, got {}", roi_size));
        }
        Ok(Self {
            n_layers,
            n_fg_class,
            pooling_func,
            anchor_scales: params
                .anchor_scales
                .clone()
                .unwrap_or_else(|| DEFAULT_ANCHOR_SCALES.to_vec()),
            mean: params.mean.unwrap_or(DEFAULT_MEAN),
            min_size: params.min_size.unwrap_or(DEFAULT_MIN_SIZE),
            max_size: params.max_size.unwrap_or(DEFAULT_MAX_SIZE),
            roi_size,
        })
    }
}

/// Thresholds used when turning raw head outputs into detections.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Preset {
    Visualize,
    Evaluate,
}

impl Preset {
    pub fn nms_thresh(&self) -> f32 {
        match self {
            Preset::Visualize => 0.3,
            Preset::Evaluate => 0.3,
        }
    }

    pub fn score_thresh(&self) -> f32 {
        match self {
            Preset::Visualize => 0.7,
            Preset::Evaluate => 0.05,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BBox,
    pub mask: GrayImage,
    pub label: usize,
    pub score: f32,
}

pub trait InstanceSegmentationModel {
    fn predict(&self, example: &TransformedExample, preset: Preset) -> Result<Vec<Detection>>;
}

/// Decodes class specific offsets for every ROI, then keeps, per foreground
/// class, the boxes above the score threshold that survive NMS.
///
/// `rois` are in input coordinates, `locs` is `(R, n_class * 4)`, `probs` is
/// `(R, n_class)` and the returned boxes are clipped to the original image.
fn suppress(
    rois: &[BBox],
    locs: &[f32],
    probs: &[f32],
    n_class: usize,
    scale: f64,
    img_size: (u32, u32),
    preset: Preset,
) -> Vec<(BBox, usize, f32)> {
    let (height, width) = (img_size.0 as f32, img_size.1 as f32);
    let mut detections = Vec::new();
    for label in 1..n_class {
        let mut cls_boxes = Vec::new();
        let mut cls_scores = Vec::new();
        for (i, roi) in rois.iter().enumerate() {
            let prob = probs[i * n_class + label];
            if prob <= preset.score_thresh() {
                continue;
            }
            let offset = (i * n_class + label) * 4;
            let mut loc = [0f32; 4];
            for (k, value) in loc.iter_mut().enumerate() {
                *value = locs[offset + k] * LOC_STD[k];
            }
            let bbox = roi
                .scale(1. / scale as f32)
                .decode(&loc)
                .clip(height, width);
            cls_boxes.push(bbox);
            cls_scores.push(prob);
        }
        for i in non_maximum_suppression(&cls_boxes, &cls_scores, preset.nms_thresh(), None) {
            detections.push((cls_boxes[i], label - 1, cls_scores[i]));
        }
    }
    detections
}

/// Mask R-CNN with a ResNet C4 backbone.
pub struct MaskRcnn {
    vs: nn::VarStore,
    extractor: FuncT<'static>,
    rpn: RegionProposalNetwork,
    head: RoiHead,
    config: ModelConfig,
    device: Device,
}

impl MaskRcnn {
    pub fn new(config: ModelConfig) -> Result<Self> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let extractor = resnet_extractor(&(&root / "extractor"), config.n_layers)?;
        let rpn = RegionProposalNetwork::new(
            &root / "rpn",
            EXTRACTOR_CHANNELS,
            EXTRACTOR_CHANNELS,
            &ANCHOR_RATIOS,
            &config.anchor_scales,
            FEAT_STRIDE,
        );
        let head = RoiHead::new(
            &root / "head",
            EXTRACTOR_CHANNELS,
            config.n_fg_class as i64 + 1,
            config.roi_size,
            1. / FEAT_STRIDE,
            config.pooling_func,
        );
        Ok(Self {
            vs,
            extractor,
            rpn,
            head,
            config,
            device: Device::Cpu,
        })
    }

    pub fn from_npz(config: ModelConfig, path: &Path) -> Result<Self> {
        let mut model = Self::new(config)?;
        weights::load_npz(&mut model.vs, path)?;
        Ok(model)
    }

    pub fn to_device(&mut self, device: Device) {
        self.vs.set_device(device);
        self.device = device;
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Detections for one image. `input` is the `(3, H, W)` network input,
    /// `scale` the factor the image was resized by and `img_size` the
    /// `(height, width)` of the original image.
    pub fn predict_image(
        &self,
        input: &Tensor,
        scale: f64,
        img_size: (u32, u32),
        preset: Preset,
    ) -> Result<Vec<Detection>> {
        let _guard = tch::no_grad_guard();
        let (_, in_h, in_w) = input.size3()?;
        let features = input
            .unsqueeze(0)
            .to_device(self.device)
            .apply_t(&self.extractor, false);
        let rois = self
            .rpn
            .propose(&features, (in_h as usize, in_w as usize), scale)?;
        let feature_map = FeatureMap::from_tensor(&features)?;

        let n_class = self.config.n_fg_class + 1;
        let (locs, scores) = self.head.predict_boxes(&feature_map, &rois, self.device);
        let probs = tensor_to_vec(&scores.softmax(1, Kind::Float))?;
        let kept = suppress(
            &rois,
            &tensor_to_vec(&locs)?,
            &probs,
            n_class,
            scale,
            img_size,
            preset,
        );
        debug!("{} detections from {} proposals", kept.len(), rois.len());
        if kept.is_empty() {
            return Ok(Vec::new());
        }

        let mask_rois = kept
            .iter()
            .map(|(bbox, _, _)| bbox.scale(scale as f32))
            .collect::<Vec<BBox>>();
        let masks = self
            .head
            .predict_masks(&feature_map, &mask_rois, self.device)
            .sigmoid()
            .to_device(Device::Cpu);
        kept.into_iter()
            .enumerate()
            .map(|(i, (bbox, label, score))| -> Result<Detection> {
                let probs = masks.get(i as i64).get(label as i64 + 1);
                Ok(Detection {
                    bbox,
                    mask: paste_mask(&probs, &bbox, img_size.0, img_size.1, MASK_THRESH)?,
                    label,
                    score,
                })
            })
            .collect()
    }
}

impl InstanceSegmentationModel for MaskRcnn {
    fn predict(&self, example: &TransformedExample, preset: Preset) -> Result<Vec<Detection>> {
        let image = &example.example.image;
        self.predict_image(
            &example.input,
            example.scale,
            (image.height(), image.width()),
            preset,
        )
    }
}
