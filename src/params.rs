use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const PARAMS_FILENAME: &str = "params.yaml";
pub const SNAPSHOT_FILENAME: &str = "snapshot_model.npz";

/// Hyperparameters recorded by the training run. Keys this tool doesn't use
/// are kept in `raw` for the echo only.
#[derive(Debug, Deserialize)]
pub struct Params {
    pub model: String,
    pub pooling_func: String,
    pub anchor_scales: Option<Vec<f32>>,
    pub mean: Option<[f32; 3]>,
    pub min_size: Option<u32>,
    pub max_size: Option<u32>,
    pub roi_size: Option<i64>,
    #[serde(skip)]
    pub raw: serde_yaml::Value,
}

impl Params {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let raw: serde_yaml::Value = serde_yaml::from_str(&content)
            .with_context(|| format!("Malformed YAML in {}", path.display()))?;
        let mut params: Params = serde_yaml::from_value(raw.clone())
            .with_context(|| format!("Invalid training config {}", path.display()))?;
        params.raw = raw;
        Ok(params)
    }

    /// The loaded document framed by comment rulers.
    pub fn dump(&self) -> Result<String> {
        let ruler = format!("# {}", "-".repeat(77));
        let body = serde_yaml::to_string(&self.raw)?;
        Ok(format!(
            "Training config:\n{}\n{}\n{}",
            ruler,
            body.trim_end(),
            ruler
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_params(content: &str) -> Result<(tempfile::TempDir, std::path::PathBuf)> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(PARAMS_FILENAME);
        fs::write(&path, content)?;
        Ok((dir, path))
    }

    #[test]
    fn load_with_defaults() -> Result<()> {
        let (_dir, path) = write_params("model: resnet50\npooling_func: align\nlr: 0.00125\n")?;
        let params = Params::load(&path)?;
        assert_eq!(params.model, "resnet50");
        assert_eq!(params.pooling_func, "align");
        assert!(params.anchor_scales.is_none());
        assert!(params.mean.is_none());
        assert!(params.roi_size.is_none());
        Ok(())
    }

    #[test]
    fn load_overrides() -> Result<()> {
        let (_dir, path) = write_params(
            "model: resnet101\npooling_func: resize\nanchor_scales: [2, 4, 8]\n\
             mean: [120, 110.5, 100]\nmin_size: 800\nmax_size: 1333\nroi_size: 14\n",
        )?;
        let params = Params::load(&path)?;
        assert_eq!(params.anchor_scales, Some(vec![2., 4., 8.]));
        assert_eq!(params.mean, Some([120., 110.5, 100.]));
        assert_eq!(params.min_size, Some(800));
        assert_eq!(params.max_size, Some(1333));
        assert_eq!(params.roi_size, Some(14));
        Ok(())
    }

    #[test]
    fn dump_keeps_unknown_keys() -> Result<()> {
        let (_dir, path) = write_params("model: resnet50\npooling_func: align\nlr: 0.5\n")?;
        let dump = Params::load(&path)?.dump()?;
        let lines = dump.lines().collect::<Vec<&str>>();
        assert_eq!(lines[0], "Training config:");
        assert_eq!(lines[1].len(), 79);
        assert_eq!(lines[1], *lines.last().unwrap_or(&""));
        assert!(dump.contains("lr: 0.5"));
        assert!(dump.contains("pooling_func: align"));
        Ok(())
    }

    #[test]
    fn load_fails_on_missing_or_malformed_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(Params::load(&dir.path().join(PARAMS_FILENAME)).is_err());
        let (_dir, path) = write_params("model: [unclosed\n")?;
        assert!(Params::load(&path).is_err());
        let (_dir, path) = write_params("pooling_func: align\n")?;
        assert!(Params::load(&path).is_err());
        Ok(())
    }
}
