use anyhow::{anyhow, bail, Result};
use std::convert::TryFrom;
use std::str::FromStr;
use tch::{Device, Kind, Tensor};

pub fn parse_number<T: FromStr>(value: &str, name: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| anyhow!("Invalid value {:?} for {}", value, name))
}

/// Maps the `--gpu` flag to a device. Negative ids never touch the CUDA API,
/// and a requested device that doesn't exist is an error rather than a
/// silent fallback to CPU.
pub fn select_device(gpu: i64) -> Result<Device> {
    if gpu < 0 {
        return Ok(Device::Cpu);
    }
    if !tch::Cuda::is_available() {
        bail!("GPU {} was requested, but CUDA is not available", gpu);
    }
    let device_count = tch::Cuda::device_count();
    if gpu >= device_count {
        bail!(
            "GPU {} was requested, but only {} CUDA device(s) found",
            gpu,
            device_count
        );
    }
    Ok(Device::Cuda(gpu as usize))
}

/// Copies a tensor of any shape into a flat, row-major `Vec<f32>` on the host.
pub fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    let flat = tensor
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .contiguous()
        .view([-1]);
    Ok(Vec::<f32>::try_from(&flat)?)
}

/// Indices of `scores` ordered from the highest score to the lowest.
/// Ties keep their original order.
pub fn argsort_desc(scores: &[f32]) -> Vec<usize> {
    let mut order = (0..scores.len()).collect::<Vec<usize>>();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_number_test() -> Result<()> {
        assert_eq!(parse_number::<i64>("-1", "gpu")?, -1);
        assert_eq!(parse_number::<usize>("600", "min size")?, 600);
        assert!(parse_number::<i64>("zero", "gpu").is_err());
        Ok(())
    }

    #[test]
    fn negative_gpu_selects_cpu() -> Result<()> {
        assert_eq!(select_device(-1)?, Device::Cpu);
        assert_eq!(select_device(-7)?, Device::Cpu);
        Ok(())
    }

    #[test]
    fn missing_gpu_fails_fast() {
        if !tch::Cuda::is_available() {
            assert!(select_device(0).is_err());
        } else {
            let count = tch::Cuda::device_count();
            assert!(select_device(count).is_err());
        }
    }

    #[test]
    fn tensor_to_vec_test() -> Result<()> {
        let tensor = Tensor::from_slice(&[1., 2., 3., 4., 5., 6.]).view([2, 3]);
        assert_eq!(
            tensor_to_vec(&tensor.transpose(0, 1))?,
            vec![1., 4., 2., 5., 3., 6.]
        );
        Ok(())
    }

    #[test]
    fn argsort_desc_test() {
        assert_eq!(argsort_desc(&[0.2, 0.9, 0.5, 0.9]), vec![1, 3, 2, 0]);
        assert!(argsort_desc(&[]).is_empty());
    }
}
