use anyhow::{anyhow, Result};
use tch::{nn, nn::Conv2D, nn::FuncT, nn::ModuleT, nn::SequentialT};

const BN_EPS: f64 = 2e-5;

pub fn conv2d(
    p: nn::Path,
    c_in: i64,
    c_out: i64,
    ksize: i64,
    padding: i64,
    stride: i64,
    bias: bool,
) -> Conv2D {
    let conv2d_cfg = nn::ConvConfig {
        stride,
        padding,
        bias,
        ..Default::default()
    };
    nn::conv2d(&p, c_in, c_out, ksize, conv2d_cfg)
}

fn batch_norm(p: nn::Path, c: i64) -> nn::BatchNorm {
    let bn_cfg = nn::BatchNormConfig {
        eps: BN_EPS,
        ..Default::default()
    };
    nn::batch_norm2d(&p, c, bn_cfg)
}

/// Number of bottleneck blocks in res2..res5 for a given depth.
pub fn block_counts(n_layers: i64) -> Result<[i64; 4]> {
    match n_layers {
        50 => Ok([3, 4, 6, 3]),
        101 => Ok([3, 4, 23, 3]),
        152 => Ok([3, 8, 36, 3]),
        _ => Err(anyhow!(
            "Unsupported ResNet depth {} (expected 50, 101 or 152)",
            n_layers
        )),
    }
}

/// First block of a stage: strided 1x1 reduction plus a projection shortcut.
fn bottleneck_a(p: nn::Path, c_in: i64, c_mid: i64, c_out: i64, stride: i64) -> impl ModuleT {
    let conv1 = conv2d(&p / "conv1", c_in, c_mid, 1, 0, stride, false);
    let bn1 = batch_norm(&p / "bn1", c_mid);
    let conv2 = conv2d(&p / "conv2", c_mid, c_mid, 3, 1, 1, false);
    let bn2 = batch_norm(&p / "bn2", c_mid);
    let conv3 = conv2d(&p / "conv3", c_mid, c_out, 1, 0, 1, false);
    let bn3 = batch_norm(&p / "bn3", c_out);
    let conv4 = conv2d(&p / "conv4", c_in, c_out, 1, 0, stride, false);
    let bn4 = batch_norm(&p / "bn4", c_out);
    nn::func_t(move |xs, train| {
        let h1 = xs
            .apply_t(&conv1, train)
            .apply_t(&bn1, train)
            .relu()
            .apply_t(&conv2, train)
            .apply_t(&bn2, train)
            .relu()
            .apply_t(&conv3, train)
            .apply_t(&bn3, train);
        let h2 = xs.apply_t(&conv4, train).apply_t(&bn4, train);
        (h1 + h2).relu()
    })
}

fn bottleneck_b(p: nn::Path, c_in: i64, c_mid: i64) -> impl ModuleT {
    let conv1 = conv2d(&p / "conv1", c_in, c_mid, 1, 0, 1, false);
    let bn1 = batch_norm(&p / "bn1", c_mid);
    let conv2 = conv2d(&p / "conv2", c_mid, c_mid, 3, 1, 1, false);
    let bn2 = batch_norm(&p / "bn2", c_mid);
    let conv3 = conv2d(&p / "conv3", c_mid, c_in, 1, 0, 1, false);
    let bn3 = batch_norm(&p / "bn3", c_in);
    nn::func_t(move |xs, train| {
        (xs.apply_t(&conv1, train)
            .apply_t(&bn1, train)
            .relu()
            .apply_t(&conv2, train)
            .apply_t(&bn2, train)
            .relu()
            .apply_t(&conv3, train)
            .apply_t(&bn3, train)
            + xs)
            .relu()
    })
}

/// A ResNet stage: block `a` followed by `b1..b{cnt - 1}`.
pub fn building_block(
    p: nn::Path,
    cnt: i64,
    c_in: i64,
    c_mid: i64,
    c_out: i64,
    stride: i64,
) -> SequentialT {
    let mut layer = nn::seq_t().add(bottleneck_a(&p / "a", c_in, c_mid, c_out, stride));
    for block_index in 1..cnt {
        layer = layer.add(bottleneck_b(
            &p / &format!("b{}", block_index),
            c_out,
            c_mid,
        ));
    }
    layer
}

/// ResNet trunk up to res4: stride 16, 1024 output channels.
pub fn resnet_extractor(p: &nn::Path, n_layers: i64) -> Result<FuncT<'static>> {
    let counts = block_counts(n_layers)?;
    let conv1 = conv2d(p / "conv1", 3, 64, 7, 3, 2, true);
    let bn1 = batch_norm(p / "bn1", 64);
    let res2 = building_block(p / "res2", counts[0], 64, 64, 256, 1);
    let res3 = building_block(p / "res3", counts[1], 256, 128, 512, 2);
    let res4 = building_block(p / "res4", counts[2], 512, 256, 1024, 2);

    Ok(nn::func_t(move |xs, train| {
        xs.apply_t(&conv1, train)
            .apply_t(&bn1, train)
            .relu()
            .max_pool2d([3, 3], [2, 2], [0, 0], [1, 1], true)
            .apply_t(&res2, train)
            .apply_t(&res3, train)
            .apply_t(&res4, train)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind, Tensor};

    #[test]
    fn block_counts_test() -> Result<()> {
        assert_eq!(block_counts(50)?, [3, 4, 6, 3]);
        assert_eq!(block_counts(101)?, [3, 4, 23, 3]);
        assert!(block_counts(18).is_err());
        Ok(())
    }

    #[test]
    fn building_block_names_follow_stage_layout() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _block = building_block(&vs.root() / "res5", 3, 64, 16, 128, 2);
        let variables = vs.variables();
        assert!(variables.contains_key("res5.a.conv4.weight"));
        assert!(variables.contains_key("res5.a.bn4.running_var"));
        assert!(variables.contains_key("res5.b2.conv3.weight"));
        assert!(!variables.contains_key("res5.b3.conv1.weight"));
        assert!(!variables.contains_key("res5.a.conv1.bias"));
    }

    #[test]
    fn building_block_output_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = building_block(&vs.root() / "res", 2, 8, 4, 16, 2);
        let xs = Tensor::zeros([1, 8, 10, 12], (Kind::Float, Device::Cpu));
        let ys = xs.apply_t(&block, false);
        assert_eq!(ys.size(), vec![1, 16, 5, 6]);
    }

    #[test]
    fn extractor_has_stride_16() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let extractor = resnet_extractor(&vs.root(), 50)?;
        assert!(vs.variables().contains_key("conv1.bias"));
        let xs = Tensor::zeros([1, 3, 64, 96], (Kind::Float, Device::Cpu));
        let ys = tch::no_grad(|| xs.apply_t(&extractor, false));
        assert_eq!(ys.size(), vec![1, 1024, 4, 6]);
        Ok(())
    }
}
