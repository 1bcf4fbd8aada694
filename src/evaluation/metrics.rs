use crate::dataset::InstanceAnnotation;
use crate::mask_rcnn::Detection;
use crate::utils::argsort_desc;
use image::GrayImage;
use itertools::izip;
use rayon::prelude::*;

/// Pairwise IoU of binary masks, `(preds.len(), gts.len())` row major.
/// Masks must share their size; an empty union counts as no overlap.
pub fn mask_iou(preds: &[&GrayImage], gts: &[&GrayImage]) -> Vec<f32> {
    let gt_areas = gts.iter().map(|m| mask_area(m)).collect::<Vec<usize>>();
    preds
        .par_iter()
        .flat_map_iter(|pred| {
            let pred_area = mask_area(pred);
            gts.iter().zip(&gt_areas).map(move |(gt, &gt_area)| {
                let intersection = pred
                    .as_raw()
                    .iter()
                    .zip(gt.as_raw())
                    .filter(|(&p, &g)| p > 0 && g > 0)
                    .count();
                let union = pred_area + gt_area - intersection;
                if union == 0 {
                    0.
                } else {
                    intersection as f32 / union as f32
                }
            })
        })
        .collect()
}

fn mask_area(mask: &GrayImage) -> usize {
    mask.as_raw().iter().filter(|&&v| v > 0).count()
}

/// Collects, per class, the score of every prediction and whether it hit a
/// ground truth instance, across all evaluated images.
#[derive(Debug)]
pub struct PrecRecAccumulator {
    iou_thresh: f32,
    n_pos: Vec<usize>,
    scores: Vec<Vec<f32>>,
    matches: Vec<Vec<bool>>,
}

impl PrecRecAccumulator {
    pub fn new(n_class: usize, iou_thresh: f32) -> Self {
        Self {
            iou_thresh,
            n_pos: vec![0; n_class],
            scores: vec![Vec::new(); n_class],
            matches: vec![Vec::new(); n_class],
        }
    }

    pub fn n_class(&self) -> usize {
        self.n_pos.len()
    }

    /// Adds the predictions of one image. Labels outside the accumulator's
    /// classes are ignored.
    pub fn add_image(&mut self, preds: &[Detection], gts: &[InstanceAnnotation]) {
        for label in 0..self.n_class() {
            let class_preds = preds
                .iter()
                .filter(|d| d.label == label)
                .collect::<Vec<&Detection>>();
            let class_gts = gts
                .iter()
                .filter(|g| g.label == label)
                .map(|g| &g.mask)
                .collect::<Vec<&GrayImage>>();
            self.n_pos[label] += class_gts.len();
            if class_preds.is_empty() {
                continue;
            }

            let pred_scores = class_preds.iter().map(|d| d.score).collect::<Vec<f32>>();
            let order = argsort_desc(&pred_scores);
            let pred_masks = order
                .iter()
                .map(|&i| &class_preds[i].mask)
                .collect::<Vec<&GrayImage>>();
            self.scores[label].extend(order.iter().map(|&i| pred_scores[i]));

            if class_gts.is_empty() {
                self.matches[label].extend(std::iter::repeat(false).take(order.len()));
                continue;
            }

            let iou = mask_iou(&pred_masks, &class_gts);
            let n_gt = class_gts.len();
            let mut selected = vec![false; n_gt];
            for row in iou.chunks(n_gt) {
                let (best, best_iou) = row
                    .iter()
                    .enumerate()
                    .fold((0, f32::MIN), |acc, (j, &v)| if v > acc.1 { (j, v) } else { acc });
                if best_iou >= self.iou_thresh && !selected[best] {
                    selected[best] = true;
                    self.matches[label].push(true);
                } else {
                    self.matches[label].push(false);
                }
            }
        }
    }

    /// Precision and recall curves per class. Recall is `None` for classes
    /// without ground truth, both are `None` for classes never predicted.
    pub fn prec_rec(&self) -> (Vec<Option<Vec<f64>>>, Vec<Option<Vec<f64>>>) {
        let mut precs = Vec::with_capacity(self.n_class());
        let mut recs = Vec::with_capacity(self.n_class());
        for (&n_pos, scores, matches) in izip!(&self.n_pos, &self.scores, &self.matches) {
            let order = argsort_desc(scores);
            let (mut tp, mut fp) = (0usize, 0usize);
            let mut prec = Vec::with_capacity(order.len());
            let mut rec = Vec::with_capacity(order.len());
            for i in order {
                if matches[i] {
                    tp += 1;
                } else {
                    fp += 1;
                }
                prec.push(tp as f64 / (tp + fp) as f64);
                rec.push(tp as f64 / n_pos as f64);
            }
            let seen = !scores.is_empty() || n_pos > 0;
            precs.push(if seen { Some(prec) } else { None });
            recs.push(if n_pos > 0 { Some(rec) } else { None });
        }
        (precs, recs)
    }
}

/// Average precision of each class; `NaN` where precision or recall is
/// undefined. With `use_07_metric` the 11-point interpolation of VOC 2007 is
/// used, otherwise the area under the interpolated curve.
pub fn calc_voc_ap(
    precs: &[Option<Vec<f64>>],
    recs: &[Option<Vec<f64>>],
    use_07_metric: bool,
) -> Vec<f64> {
    precs
        .iter()
        .zip(recs)
        .map(|(prec, rec)| match (prec, rec) {
            (Some(prec), Some(rec)) if use_07_metric => eleven_point_ap(prec, rec),
            (Some(prec), Some(rec)) => area_ap(prec, rec),
            _ => f64::NAN,
        })
        .collect()
}

fn eleven_point_ap(prec: &[f64], rec: &[f64]) -> f64 {
    (0..=10)
        .map(|i| {
            // same steps as np.arange(0., 1.1, 0.1)
            let t = 0. + i as f64 * 0.1;
            prec.iter()
                .zip(rec)
                .filter(|(_, &r)| r >= t)
                .map(|(&p, _)| if p.is_nan() { 0. } else { p })
                .fold(0f64, f64::max)
                / 11.
        })
        .sum()
}

fn area_ap(prec: &[f64], rec: &[f64]) -> f64 {
    let mut mpre = Vec::with_capacity(prec.len() + 2);
    mpre.push(0.);
    mpre.extend(prec.iter().map(|p| if p.is_nan() { 0. } else { *p }));
    mpre.push(0.);
    let mut mrec = Vec::with_capacity(rec.len() + 2);
    mrec.push(0.);
    mrec.extend_from_slice(rec);
    mrec.push(1.);

    for i in (1..mpre.len()).rev() {
        mpre[i - 1] = mpre[i - 1].max(mpre[i]);
    }
    (1..mrec.len())
        .filter(|&i| (mrec[i] - mrec[i - 1]).abs() > 0.)
        .map(|i| (mrec[i] - mrec[i - 1]) * mpre[i])
        .sum()
}
