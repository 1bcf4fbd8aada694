#[macro_use]
extern crate lazy_static;
extern crate log;
extern crate log4rs;
extern crate tch;

#[macro_use]
mod macros;
mod dataset;
mod evaluation;
mod image_ops;
mod mask_rcnn;
mod options;
mod params;
mod utils;
mod visualization;

use anyhow::Result;
use dataset::transform::MaskRcnnTransform;
use dataset::voc::VocInstanceSegmentationDataset;
use dataset::{IndexingDataset, TransformDataset};
use evaluation::{eval_result_path, save_result, InstanceSegmentationVocEvaluator};
use log::{info, Level, LevelFilter};
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use mask_rcnn::{MaskRcnn, ModelConfig};
use options::EvalOptions;
use params::Params;
use std::path::Path;
use utils::select_device;
use visualization::{InstanceSegmentationVisReport, VisTarget, VIS_FILENAME, VIS_INDICES};

const LOG_CONFIG_FILE: &str = "log4rs.yml";
const VAL_SPLIT: &str = "val";

fn init_logging() -> Result<()> {
    if Path::new(LOG_CONFIG_FILE).exists() {
        log4rs::init_file(LOG_CONFIG_FILE, Default::default())?;
        return Ok(());
    }
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} {h({l})} {t} - {m}{n}",
        )))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(LevelFilter::Info))?;
    log4rs::init_config(config)?;
    Ok(())
}

fn run(opts: &EvalOptions) -> Result<()> {
    let params = Params::load(&opts.params_path())?;
    println!("{}", params.dump()?);

    let dataset = VocInstanceSegmentationDataset::from_env(VAL_SPLIT)?;
    let class_names = dataset.class_names();
    let _guard = tch::no_grad_guard();

    let config = ModelConfig::from_params(&params, class_names.len())?;
    info!(
        "Building resnet{} Mask R-CNN with {} for {} classes",
        config.n_layers,
        config.pooling_func,
        config.n_fg_class
    );
    let device = select_device(opts.gpu)?;
    let snapshot = opts.snapshot_path();
    println!("Using pretrained_model: {}", snapshot.display());
    let mut model = measure_time!(
        "loading model",
        || MaskRcnn::from_npz(config, &snapshot),
        Level::Info
    )?;
    model.to_device(device);

    let test_data = TransformDataset::new(&dataset, MaskRcnnTransform::from_config(model.config()));

    println!("Visualizing...");
    let vis_data = IndexingDataset::new(&test_data, VIS_INDICES.to_vec())?;
    let report = InstanceSegmentationVisReport::new(vis_data, &model, class_names, VIS_FILENAME);
    let target = VisTarget {
        iteration: "best".to_string(),
        out: opts.log_dir.clone(),
    };
    let vis_path = measure_time!("visualization", || report.report(&target), Level::Info)?;
    println!("Saved visualization: {}", vis_path.display());

    println!("Evaluating...");
    let evaluator = InstanceSegmentationVocEvaluator::new(&test_data, &model, class_names, true);
    let result = measure_time!("evaluation", || evaluator.evaluate(), Level::Info)?;
    let result_path = eval_result_path(&snapshot);
    save_result(&result, &result_path)?;
    println!("Saved evaluation: {}", result_path.display());
    for (key, value) in &result {
        println!("{}: {}", key, value);
    }
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;
    let matches = options::build_app().get_matches();
    let opts = EvalOptions::new(&matches)?;
    run(&opts)
}
