use super::bbox::{non_maximum_suppression, BBox};
use super::resnet::conv2d;
use crate::utils::{argsort_desc, tensor_to_vec};
use anyhow::{anyhow, Result};
use log::debug;
use tch::{nn, nn::Conv2D, Kind, Tensor};

const ANCHOR_BASE_SIZE: f32 = 16.;

/// Anchors centred on the first feature cell, one per `(ratio, scale)` pair
/// with the ratio varying slowest.
pub fn generate_anchor_base(base_size: f32, ratios: &[f32], anchor_scales: &[f32]) -> Vec<BBox> {
    let py = base_size / 2.;
    let px = base_size / 2.;
    let mut anchors = Vec::with_capacity(ratios.len() * anchor_scales.len());
    for ratio in ratios {
        for scale in anchor_scales {
            let h = base_size * scale * ratio.sqrt();
            let w = base_size * scale * (1. / ratio).sqrt();
            anchors.push(BBox::new(
                py - h / 2.,
                px - w / 2.,
                py + h / 2.,
                px + w / 2.,
            ));
        }
    }
    anchors
}

/// Shifts the base anchors over every feature cell. The result is ordered by
/// cell (row major), then by base anchor.
pub fn enumerate_shifted_anchors(
    anchor_base: &[BBox],
    feat_stride: f32,
    height: usize,
    width: usize,
) -> Vec<BBox> {
    let mut anchors = Vec::with_capacity(height * width * anchor_base.len());
    for y in 0..height {
        let shift_y = y as f32 * feat_stride;
        for x in 0..width {
            let shift_x = x as f32 * feat_stride;
            for base in anchor_base {
                anchors.push(BBox::new(
                    base.y_min + shift_y,
                    base.x_min + shift_x,
                    base.y_max + shift_y,
                    base.x_max + shift_x,
                ));
            }
        }
    }
    anchors
}

/// Turns anchor offsets and objectness into a ranked set of proposals.
#[derive(Debug, Clone)]
pub struct ProposalCreator {
    pub nms_thresh: f32,
    pub n_pre_nms: usize,
    pub n_post_nms: usize,
    pub min_size: f32,
}

impl Default for ProposalCreator {
    fn default() -> Self {
        Self {
            nms_thresh: 0.7,
            n_pre_nms: 6000,
            n_post_nms: 1000,
            min_size: 0.,
        }
    }
}

impl ProposalCreator {
    pub fn create(
        &self,
        locs: &[f32],
        scores: &[f32],
        anchors: &[BBox],
        img_size: (usize, usize),
        scale: f64,
    ) -> Result<Vec<BBox>> {
        if locs.len() != anchors.len() * 4 || scores.len() != anchors.len() {
            return Err(anyhow!(
                "Got {} anchors, {} offsets and {} scores",
                anchors.len(),
                locs.len() / 4,
                scores.len()
            ));
        }
        let (height, width) = (img_size.0 as f32, img_size.1 as f32);
        let min_size = self.min_size * scale as f32;

        let mut rois = Vec::with_capacity(anchors.len());
        let mut roi_scores = Vec::with_capacity(anchors.len());
        for (i, anchor) in anchors.iter().enumerate() {
            let roi = anchor.decode(&locs[i * 4..i * 4 + 4]).clip(height, width);
            if roi.height() >= min_size && roi.width() >= min_size {
                rois.push(roi);
                roi_scores.push(scores[i]);
            }
        }

        let order = argsort_desc(&roi_scores)
            .into_iter()
            .take(self.n_pre_nms)
            .collect::<Vec<usize>>();
        let rois = order.iter().map(|&i| rois[i]).collect::<Vec<BBox>>();
        let roi_scores = order.iter().map(|&i| roi_scores[i]).collect::<Vec<f32>>();

        let keep =
            non_maximum_suppression(&rois, &roi_scores, self.nms_thresh, Some(self.n_post_nms));
        Ok(keep.into_iter().map(|i| rois[i]).collect())
    }
}

#[derive(Debug)]
pub struct RegionProposalNetwork {
    conv1: Conv2D,
    score: Conv2D,
    loc: Conv2D,
    anchor_base: Vec<BBox>,
    feat_stride: f32,
    proposal_creator: ProposalCreator,
}

impl RegionProposalNetwork {
    pub fn new(
        p: nn::Path,
        c_in: i64,
        c_mid: i64,
        ratios: &[f32],
        anchor_scales: &[f32],
        feat_stride: f32,
    ) -> Self {
        let anchor_base = generate_anchor_base(ANCHOR_BASE_SIZE, ratios, anchor_scales);
        let n_anchor = anchor_base.len() as i64;
        Self {
            conv1: conv2d(&p / "conv1", c_in, c_mid, 3, 1, 1, true),
            score: conv2d(&p / "score", c_mid, n_anchor * 2, 1, 0, 1, true),
            loc: conv2d(&p / "loc", c_mid, n_anchor * 4, 1, 0, 1, true),
            anchor_base,
            feat_stride,
            proposal_creator: ProposalCreator::default(),
        }
    }

    /// Proposals for one image, in the coordinates of the network input.
    ///
    /// `features` has shape `(1, C, H, W)`, `img_size` is the `(height, width)`
    /// of the network input and `scale` the factor it was resized by.
    pub fn propose(
        &self,
        features: &Tensor,
        img_size: (usize, usize),
        scale: f64,
    ) -> Result<Vec<BBox>> {
        let (_, _, hh, ww) = features.size4()?;
        let n_anchor = self.anchor_base.len() as i64;
        let h = features.apply(&self.conv1).relu();

        let locs = h
            .apply(&self.loc)
            .permute([0, 2, 3, 1])
            .contiguous()
            .view([-1, 4]);
        let fg_scores = h
            .apply(&self.score)
            .permute([0, 2, 3, 1])
            .contiguous()
            .view([1, hh, ww, n_anchor, 2])
            .softmax(4, Kind::Float)
            .select(4, 1);

        let anchors =
            enumerate_shifted_anchors(&self.anchor_base, self.feat_stride, hh as usize, ww as usize);
        let rois = self.proposal_creator.create(
            &tensor_to_vec(&locs)?,
            &tensor_to_vec(&fg_scores)?,
            &anchors,
            img_size,
            scale,
        )?;
        debug!(
            "{} proposals from {} anchors ({}x{} cells)",
            rois.len(),
            anchors.len(),
            hh,
            ww
        );
        Ok(rois)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn anchor_base_test() {
        let anchors = generate_anchor_base(16., &[0.5, 1., 2.], &[8., 16., 32.]);
        assert_eq!(anchors.len(), 9);
        // ratio 1, scale 8: a 128x128 square centred on (8, 8)
        assert_eq!(anchors[3], BBox::new(-56., -56., 72., 72.));
        // ratio 0.5 gives boxes wider than tall
        assert!(anchors[0].width() > anchors[0].height());
        assert!((anchors[0].height() * anchors[0].width() - 128. * 128.).abs() < 1.);
    }

    #[test]
    fn shifted_anchors_order() {
        let base = vec![BBox::new(0., 0., 16., 16.), BBox::new(-8., -8., 24., 24.)];
        let anchors = enumerate_shifted_anchors(&base, 16., 2, 3);
        assert_eq!(anchors.len(), 12);
        // second anchor of the second cell in the first row
        assert_eq!(anchors[3], BBox::new(-8., 8., 24., 40.));
        // first anchor of the first cell in the second row
        assert_eq!(anchors[6], BBox::new(16., 0., 32., 16.));
    }

    #[test]
    fn proposal_creator_ranks_and_suppresses() -> Result<()> {
        let anchors = vec![
            BBox::new(0., 0., 10., 10.),
            BBox::new(1., 1., 11., 11.),
            BBox::new(20., 20., 30., 30.),
            BBox::new(40., 40., 60., 60.),
        ];
        let locs = vec![0.; 16];
        let scores = vec![0.6, 0.9, 0.4, 0.8];
        let creator = ProposalCreator {
            nms_thresh: 0.5,
            n_pre_nms: 3,
            n_post_nms: 10,
            min_size: 0.,
        };
        let rois = creator.create(&locs, &scores, &anchors, (50, 50), 1.)?;
        // the 0.4 box misses the pre-NMS cut, the 0.6 box is suppressed,
        // the last box is clipped to the image
        assert_eq!(
            rois,
            vec![BBox::new(1., 1., 11., 11.), BBox::new(40., 40., 50., 50.)]
        );
        Ok(())
    }

    #[test]
    fn proposal_creator_drops_small_boxes() -> Result<()> {
        let anchors = vec![BBox::new(0., 0., 4., 4.), BBox::new(0., 0., 32., 32.)];
        let creator = ProposalCreator {
            min_size: 8.,
            ..Default::default()
        };
        let rois = creator.create(&[0.; 8], &[0.9, 0.1], &anchors, (64, 64), 2.)?;
        assert_eq!(rois, vec![BBox::new(0., 0., 32., 32.)]);
        assert!(creator.create(&[0.; 4], &[0.9, 0.1], &anchors, (64, 64), 1.).is_err());
        Ok(())
    }

    #[test]
    fn rpn_proposals_stay_inside_image() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let rpn = RegionProposalNetwork::new(
            &vs.root() / "rpn",
            8,
            8,
            &[0.5, 1., 2.],
            &[2., 4.],
            16.,
        );
        assert!(vs.variables().contains_key("rpn.score.weight"));
        assert_eq!(vs.variables()["rpn.loc.weight"].size(), vec![24, 8, 1, 1]);
        let features = Tensor::randn([1, 8, 3, 4], (Kind::Float, Device::Cpu));
        let rois = tch::no_grad(|| rpn.propose(&features, (48, 64), 1.))?;
        assert!(!rois.is_empty());
        assert!(rois.len() <= 3 * 4 * 6);
        for roi in rois {
            assert!(roi.y_min >= 0. && roi.y_max <= 48.);
            assert!(roi.x_min >= 0. && roi.x_max <= 64.);
        }
        Ok(())
    }
}
