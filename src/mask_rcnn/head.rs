use super::bbox::BBox;
use super::pooling::{FeatureMap, PoolingFunc};
use super::resnet::{building_block, conv2d};
use tch::{nn, nn::ConvTranspose2D, nn::ModuleT, Device, Tensor};

/// ROIs pushed through res5 at once; bounds the activation memory.
const ROI_CHUNK: usize = 256;
const RES5_MID_CHANNELS: i64 = 512;
const RES5_OUT_CHANNELS: i64 = 2048;
const MASK_CHANNELS: i64 = 256;

/// Per-ROI classification, box refinement and mask prediction on top of the
/// pooled stride-16 features.
#[derive(Debug)]
pub struct RoiHead {
    res5: nn::SequentialT,
    cls_loc: nn::Linear,
    score: nn::Linear,
    deconv6: ConvTranspose2D,
    mask: nn::Conv2D,
    n_class: i64,
    roi_size: usize,
    spatial_scale: f32,
    pooling_func: PoolingFunc,
}

impl RoiHead {
    pub fn new(
        p: nn::Path,
        c_in: i64,
        n_class: i64,
        roi_size: i64,
        spatial_scale: f32,
        pooling_func: PoolingFunc,
    ) -> Self {
        let res5_stride = (roi_size / 7).max(1);
        let deconv_cfg = nn::ConvTransposeConfig {
            stride: 2,
            ..Default::default()
        };
        Self {
            res5: building_block(
                &p / "res5",
                3,
                c_in,
                RES5_MID_CHANNELS,
                RES5_OUT_CHANNELS,
                res5_stride,
            ),
            cls_loc: nn::linear(&p / "cls_loc", RES5_OUT_CHANNELS, n_class * 4, Default::default()),
            score: nn::linear(&p / "score", RES5_OUT_CHANNELS, n_class, Default::default()),
            deconv6: nn::conv_transpose2d(&p / "deconv6", RES5_OUT_CHANNELS, MASK_CHANNELS, 2, deconv_cfg),
            mask: conv2d(&p / "mask", MASK_CHANNELS, n_class, 1, 0, 1, true),
            n_class,
            roi_size: roi_size as usize,
            spatial_scale,
            pooling_func,
        }
    }

    /// Side of the square mask predicted for each ROI.
    pub fn mask_size(&self) -> usize {
        let stride = (self.roi_size / 7).max(1);
        (self.roi_size + stride - 1) / stride * 2
    }

    fn res5_features(&self, features: &FeatureMap, rois: &[BBox], device: Device) -> Tensor {
        let roi_size = self.roi_size as i64;
        let pooled = self
            .pooling_func
            .apply(features, rois, self.roi_size, self.spatial_scale);
        Tensor::from_slice(&pooled)
            .view([rois.len() as i64, features.channels as i64, roi_size, roi_size])
            .to_device(device)
            .apply_t(&self.res5, false)
    }

    /// Class specific box offsets `(R, n_class * 4)` and class logits `(R, n_class)`.
    pub fn predict_boxes(
        &self,
        features: &FeatureMap,
        rois: &[BBox],
        device: Device,
    ) -> (Tensor, Tensor) {
        let mut locs = Vec::new();
        let mut scores = Vec::new();
        for chunk in rois.chunks(ROI_CHUNK) {
            let pool5 = self
                .res5_features(features, chunk, device)
                .adaptive_avg_pool2d([1, 1])
                .view([-1, RES5_OUT_CHANNELS]);
            locs.push(pool5.apply(&self.cls_loc));
            scores.push(pool5.apply(&self.score));
        }
        if locs.is_empty() {
            let empty = |n| Tensor::zeros([0, n], (tch::Kind::Float, device));
            return (empty(self.n_class * 4), empty(self.n_class));
        }
        (Tensor::cat(&locs, 0), Tensor::cat(&scores, 0))
    }

    /// Mask logits `(R, n_class, M, M)`.
    pub fn predict_masks(&self, features: &FeatureMap, rois: &[BBox], device: Device) -> Tensor {
        let mut masks = Vec::new();
        for chunk in rois.chunks(ROI_CHUNK) {
            masks.push(
                self.res5_features(features, chunk, device)
                    .apply(&self.deconv6)
                    .relu()
                    .apply(&self.mask),
            );
        }
        if masks.is_empty() {
            let size = self.mask_size() as i64;
            return Tensor::zeros([0, self.n_class, size, size], (tch::Kind::Float, device));
        }
        Tensor::cat(&masks, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant_features(channels: usize) -> FeatureMap {
        FeatureMap {
            data: vec![0.5; channels * 6 * 8],
            channels,
            height: 6,
            width: 8,
        }
    }

    #[test]
    fn head_output_shapes() {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = RoiHead::new(&vs.root() / "head", 16, 3, 7, 1. / 16., PoolingFunc::Align);
        assert_eq!(head.mask_size(), 14);
        let rois = vec![BBox::new(0., 0., 32., 32.), BBox::new(16., 16., 96., 128.)];
        let features = constant_features(16);
        let (locs, scores) = tch::no_grad(|| head.predict_boxes(&features, &rois, Device::Cpu));
        assert_eq!(locs.size(), vec![2, 12]);
        assert_eq!(scores.size(), vec![2, 3]);
        let masks = tch::no_grad(|| head.predict_masks(&features, &rois, Device::Cpu));
        assert_eq!(masks.size(), vec![2, 3, 14, 14]);
    }

    #[test]
    fn larger_roi_size_strides_res5() {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = RoiHead::new(&vs.root() / "head", 16, 2, 14, 1. / 16., PoolingFunc::Resize);
        assert_eq!(head.mask_size(), 14);
        let rois = vec![BBox::new(0., 0., 32., 32.)];
        let masks = tch::no_grad(|| head.predict_masks(&constant_features(16), &rois, Device::Cpu));
        assert_eq!(masks.size(), vec![1, 2, 14, 14]);
    }

    #[test]
    fn head_handles_no_rois() {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = RoiHead::new(&vs.root() / "head", 16, 3, 7, 1. / 16., PoolingFunc::Pooling);
        let (locs, scores) = head.predict_boxes(&constant_features(16), &[], Device::Cpu);
        assert_eq!(locs.size(), vec![0, 12]);
        assert_eq!(scores.size(), vec![0, 3]);
    }
}
