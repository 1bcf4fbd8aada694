pub mod metrics;

use crate::dataset::transform::TransformedExample;
use crate::dataset::{Dataset, SerialIter};
use crate::mask_rcnn::{InstanceSegmentationModel, Preset};
use anyhow::{bail, Context, Result};
use log::info;
use metrics::{calc_voc_ap, PrecRecAccumulator};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const IOU_THRESH: f32 = 0.5;
const PROGRESS_INTERVAL: usize = 100;

/// Metric name to value, sorted by name.
pub type EvalResult = BTreeMap<String, f64>;

/// Scores a model on an instance segmentation dataset with the VOC protocol
/// (mask IoU 0.5, 2007 11-point AP).
pub struct InstanceSegmentationVocEvaluator<'a, D, M> {
    dataset: D,
    model: &'a M,
    class_names: &'a [&'a str],
    show_progress: bool,
}

impl<'a, D, M> InstanceSegmentationVocEvaluator<'a, D, M>
where
    D: Dataset<Item = TransformedExample>,
    M: InstanceSegmentationModel,
{
    pub fn new(dataset: D, model: &'a M, class_names: &'a [&'a str], show_progress: bool) -> Self {
        Self {
            dataset,
            model,
            class_names,
            show_progress,
        }
    }

    pub fn evaluate(&self) -> Result<EvalResult> {
        let mut acc = PrecRecAccumulator::new(self.class_names.len(), IOU_THRESH);
        let start = Instant::now();
        let total = self.dataset.len();
        let mut seen = 0;
        for batch in SerialIter::new(&self.dataset, 1, true)? {
            for example in batch? {
                let detections = self.model.predict(&example, Preset::Evaluate)?;
                acc.add_image(&detections, &example.example.instances);
                seen += 1;
                if self.show_progress && (seen % PROGRESS_INTERVAL == 0 || seen == total) {
                    let elapsed = start.elapsed().as_secs_f64();
                    info!(
                        "{} / {} images evaluated ({:.2} s, {:.2} images/s)",
                        seen,
                        total,
                        elapsed,
                        seen as f64 / elapsed.max(f64::EPSILON)
                    );
                }
            }
        }

        let (precs, recs) = acc.prec_rec();
        let aps = calc_voc_ap(&precs, &recs, true);
        let mut result = EvalResult::new();
        let mut defined = Vec::new();
        for (name, &ap) in self.class_names.iter().zip(&aps) {
            if ap.is_nan() {
                continue;
            }
            result.insert(format!("main/ap/{}", name), ap);
            defined.push(ap);
        }
        if defined.is_empty() {
            bail!("No ground truth instances in {} evaluated images", seen);
        }
        result.insert(
            "main/map".to_string(),
            defined.iter().sum::<f64>() / defined.len() as f64,
        );
        Ok(result)
    }
}

/// `<snapshot>.eval_result.yaml`, next to the snapshot.
pub fn eval_result_path(snapshot: &Path) -> PathBuf {
    let mut name = snapshot.as_os_str().to_os_string();
    name.push(".eval_result.yaml");
    PathBuf::from(name)
}

/// Writes the result as a flat YAML mapping, replacing any previous file.
pub fn save_result(result: &EvalResult, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    serde_yaml::to_writer(file, result)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
