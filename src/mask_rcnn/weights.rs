use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::collections::HashSet;
use std::path::Path;
use tch::{nn::VarStore, Tensor};

/// Maps a snapshot key such as `extractor/res2/a/bn1/avg_mean` to the
/// variable name used in the var store. Returns `None` for entries without a
/// counterpart (batch norm sample counts).
pub fn npz_key_to_var_name(key: &str) -> Option<String> {
    let mut parts = key.split('/').filter(|s| !s.is_empty()).collect::<Vec<&str>>();
    let leaf = match parts.pop()? {
        "W" | "gamma" => "weight",
        "b" | "beta" => "bias",
        "avg_mean" => "running_mean",
        "avg_var" => "running_var",
        "N" => return None,
        other => other,
    };
    parts.push(leaf);
    Some(parts.join("."))
}

/// Copies every tensor of a snapshot into the matching variable.
/// All variables of the store have to be covered with the right shape.
pub fn load_npz(vs: &mut VarStore, path: &Path) -> Result<()> {
    let entries = Tensor::read_npz(path)
        .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
    let variables = vs.variables();
    let mut loaded = HashSet::new();
    tch::no_grad(|| -> Result<()> {
        for (key, value) in &entries {
            let name = match npz_key_to_var_name(key) {
                Some(name) => name,
                None => continue,
            };
            let mut var = match variables.get(&name) {
                Some(var) => var.shallow_clone(),
                None => {
                    warn!("Skipping snapshot entry {} without a matching variable", key);
                    continue;
                }
            };
            if var.size() != value.size() {
                bail!(
                    "Shape mismatch for {}: snapshot has {:?}, network expects {:?}",
                    name,
                    value.size(),
                    var.size()
                );
            }
            var.f_copy_(&value.to_kind(var.kind()))
                .with_context(|| format!("Failed to copy {}", name))?;
            loaded.insert(name);
        }
        Ok(())
    })?;

    let mut missing = variables
        .keys()
        .filter(|name| !loaded.contains(*name))
        .cloned()
        .collect::<Vec<String>>();
    if !missing.is_empty() {
        missing.sort();
        bail!(
            "Snapshot {} lacks {} parameter(s), first: {}",
            path.display(),
            missing.len(),
            missing[0]
        );
    }
    debug!("Loaded {} tensors from {}", loaded.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Device, Kind};

    #[test]
    fn npz_key_mapping() {
        assert_eq!(
            npz_key_to_var_name("extractor/conv1/W").as_deref(),
            Some("extractor.conv1.weight")
        );
        assert_eq!(
            npz_key_to_var_name("/head/res5/a/bn2/beta").as_deref(),
            Some("head.res5.a.bn2.bias")
        );
        assert_eq!(
            npz_key_to_var_name("rpn/loc/b").as_deref(),
            Some("rpn.loc.bias")
        );
        assert_eq!(
            npz_key_to_var_name("extractor/bn1/avg_var").as_deref(),
            Some("extractor.bn1.running_var")
        );
        assert_eq!(npz_key_to_var_name("extractor/bn1/N"), None);
    }

    fn small_store() -> VarStore {
        let vs = VarStore::new(Device::Cpu);
        let _linear = nn::linear(vs.root().sub("head").sub("score"), 3, 2, Default::default());
        vs
    }

    #[test]
    fn load_npz_copies_values() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("snapshot_model.npz");
        let weight = Tensor::from_slice(&[1f32, 2., 3., 4., 5., 6.]).view([2, 3]);
        let bias = Tensor::from_slice(&[0.5f32, -0.5]);
        let extra = Tensor::from_slice(&[7f32]);
        Tensor::write_npz(
            &[
                ("head/score/W", &weight),
                ("head/score/b", &bias),
                ("head/unused/W", &extra),
            ],
            &path,
        )?;

        let mut vs = small_store();
        load_npz(&mut vs, &path)?;
        let variables = vs.variables();
        let loaded = &variables["head.score.weight"];
        assert_eq!(loaded.double_value(&[1, 2]), 6.);
        assert_eq!(variables["head.score.bias"].double_value(&[1]), -0.5);
        Ok(())
    }

    #[test]
    fn load_npz_rejects_missing_and_mismatched() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let partial = dir.path().join("partial.npz");
        let weight = Tensor::zeros([2, 3], (Kind::Float, Device::Cpu));
        Tensor::write_npz(&[("head/score/W", &weight)], &partial)?;
        assert!(load_npz(&mut small_store(), &partial).is_err());

        let mismatched = dir.path().join("mismatched.npz");
        let wrong = Tensor::zeros([3, 3], (Kind::Float, Device::Cpu));
        let bias = Tensor::zeros([2], (Kind::Float, Device::Cpu));
        Tensor::write_npz(&[("head/score/W", &wrong), ("head/score/b", &bias)], &mismatched)?;
        let err = load_npz(&mut small_store(), &mismatched).unwrap_err();
        assert!(err.to_string().contains("Shape mismatch"));

        assert!(load_npz(&mut small_store(), &dir.path().join("absent.npz")).is_err());
        Ok(())
    }
}
