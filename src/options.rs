use crate::params::{PARAMS_FILENAME, SNAPSHOT_FILENAME};
use crate::utils::parse_number;
use anyhow::{anyhow, Result};
use clap::{App, AppSettings, Arg};
use std::path::PathBuf;

pub fn build_app<'a, 'b>() -> App<'a, 'b> {
    App::new("mask-rcnn-eval")
        .about("Evaluates a trained Mask R-CNN on the VOC validation split")
        .setting(AppSettings::AllowNegativeNumbers)
        .arg(
            Arg::with_name("log_dir")
                .help("Training log directory holding params.yaml and snapshot_model.npz")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("gpu")
                .short("g")
                .long("gpu")
                .takes_value(true)
                .allow_hyphen_values(true)
                .default_value("0")
                .help("CUDA device id, negative for CPU"),
        )
}

#[derive(Debug, PartialEq)]
pub struct EvalOptions {
    pub log_dir: PathBuf,
    pub gpu: i64,
}

impl EvalOptions {
    pub fn new(args: &clap::ArgMatches) -> Result<Self> {
        let log_dir = args
            .value_of("log_dir")
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("Missing log_dir"))?;
        let gpu = match args.value_of("gpu") {
            Some(gpu) => parse_number(gpu, "gpu")?,
            None => 0,
        };
        Ok(Self { log_dir, gpu })
    }

    pub fn params_path(&self) -> PathBuf {
        self.log_dir.join(PARAMS_FILENAME)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.log_dir.join(SNAPSHOT_FILENAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<EvalOptions> {
        let matches = build_app().get_matches_from_safe(args)?;
        EvalOptions::new(&matches)
    }

    #[test]
    fn defaults_to_first_gpu() -> Result<()> {
        let opts = parse(&["mask-rcnn-eval", "logs/run1"])?;
        assert_eq!(opts.gpu, 0);
        assert_eq!(opts.params_path(), PathBuf::from("logs/run1/params.yaml"));
        assert_eq!(
            opts.snapshot_path(),
            PathBuf::from("logs/run1/snapshot_model.npz")
        );
        Ok(())
    }

    #[test]
    fn accepts_negative_gpu() -> Result<()> {
        assert_eq!(parse(&["mask-rcnn-eval", "logs", "--gpu", "-1"])?.gpu, -1);
        assert_eq!(parse(&["mask-rcnn-eval", "-g", "2", "logs"])?.gpu, 2);
        Ok(())
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&["mask-rcnn-eval"]).is_err());
        assert!(parse(&["mask-rcnn-eval", "logs", "--gpu", "first"]).is_err());
        assert!(parse(&["mask-rcnn-eval", "logs", "--batch-size", "2"]).is_err());
    }
}
