//! A small seeded convolutional network with observable layers.
//!
//! `conv1 -> relu1 -> pool1 -> fc`. Weights are drawn once from a seeded
//! ChaCha stream, so two networks built from the same config are identical.

use anyhow::{bail, Result};
use ndarray::{Array1, Array2, Array4, ArrayView4, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tmeasure_core::{ForwardPass, ObservableModel};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Output channels of the convolution
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Seed of the weight stream
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_channels() -> usize {
    8
}

fn default_seed() -> u64 {
    42
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            seed: default_seed(),
        }
    }
}

pub struct SyntheticConvNet {
    input: (usize, usize, usize),
    /// `out x in x 3 x 3`
    kernels: Array4<f32>,
    bias: Array1<f32>,
    /// `classes x (out * pooled_h * pooled_w)`
    dense: Array2<f32>,
}

impl SyntheticConvNet {
    /// Build a network for `C x H x W` inputs with `classes` outputs.
    pub fn new(config: &ModelConfig, input: (usize, usize, usize), classes: usize) -> Result<Self> {
        let (c, h, w) = input;
        if c == 0 || h < 2 || w < 2 {
            bail!("input {}x{}x{} is too small for conv + 2x2 pooling", c, h, w);
        }
        if config.channels == 0 || classes == 0 {
            bail!("network needs at least one channel and one class");
        }

        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let conv_scale = 1.0 / ((c * 9) as f32).sqrt();
        let kernels = Array4::from_shape_fn((config.channels, c, 3, 3), |_| {
            rng.gen_range(-1.0f32..1.0) * conv_scale
        });
        let bias = Array1::from_shape_fn(config.channels, |_| rng.gen_range(-0.1f32..0.1));

        let features = config.channels * (h / 2) * (w / 2);
        let dense_scale = 1.0 / (features as f32).sqrt();
        let dense = Array2::from_shape_fn((classes, features), |_| {
            rng.gen_range(-1.0f32..1.0) * dense_scale
        });

        Ok(Self {
            input,
            kernels,
            bias,
            dense,
        })
    }

    fn convolve(&self, batch: ArrayView4<'_, f32>) -> Array4<f32> {
        let (n, c, h, w) = batch.dim();
        let out_channels = self.kernels.len_of(Axis(0));
        Array4::from_shape_fn((n, out_channels, h, w), |(row, o, y, x)| {
            let mut acc = self.bias[o];
            for i in 0..c {
                for ky in 0..3 {
                    for kx in 0..3 {
                        let (sy, sx) = (y + ky, x + kx);
                        // padding of one pixel on every side
                        if sy == 0 || sx == 0 || sy > h || sx > w {
                            continue;
                        }
                        acc += self.kernels[[o, i, ky, kx]] * batch[[row, i, sy - 1, sx - 1]];
                    }
                }
            }
            acc
        })
    }
}

fn average_pool(maps: &Array4<f32>) -> Array4<f32> {
    let (n, c, h, w) = maps.dim();
    Array4::from_shape_fn((n, c, h / 2, w / 2), |(row, ch, y, x)| {
        let (y0, x0) = (2 * y, 2 * x);
        (maps[[row, ch, y0, x0]]
            + maps[[row, ch, y0 + 1, x0]]
            + maps[[row, ch, y0, x0 + 1]]
            + maps[[row, ch, y0 + 1, x0 + 1]])
            / 4.0
    })
}

impl ObservableModel for SyntheticConvNet {
    fn layer_names(&self) -> Vec<String> {
        ["conv1", "relu1", "pool1", "fc"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn forward_pass(&self, batch: ArrayView4<'_, f32>) -> Result<ForwardPass> {
        let (n, c, h, w) = batch.dim();
        if (c, h, w) != self.input {
            bail!(
                "expected inputs of shape {:?}, got {:?}",
                self.input,
                (c, h, w)
            );
        }

        let conv = self.convolve(batch);
        let relu = conv.mapv(|v| v.max(0.0));
        let pooled = average_pool(&relu);

        let flat = pooled
            .to_shape((n, self.dense.len_of(Axis(1))))?
            .to_owned();
        let logits = flat.dot(&self.dense.t());

        Ok(ForwardPass {
            output: logits.clone().into_dyn(),
            activations: vec![
                conv.into_dyn(),
                relu.into_dyn(),
                pooled.into_dyn(),
                logits.into_dyn(),
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn net() -> SyntheticConvNet {
        SyntheticConvNet::new(&ModelConfig::default(), (1, 8, 8), 3).unwrap()
    }

    #[test]
    fn test_layer_shapes() {
        let batch = Array4::<f32>::ones((2, 1, 8, 8));
        let pass = net().forward_pass(batch.view()).unwrap();
        let shapes: Vec<Vec<usize>> = pass.activations.iter().map(|a| a.shape().to_vec()).collect();
        assert_eq!(
            shapes,
            vec![vec![2, 8, 8, 8], vec![2, 8, 8, 8], vec![2, 8, 4, 4], vec![2, 3]]
        );
        assert_eq!(pass.output.shape(), &[2, 3]);
    }

    #[test]
    fn test_seeded_weights_are_reproducible() {
        let batch = Array4::from_shape_fn((1, 1, 8, 8), |(_, _, y, x)| (y * x) as f32 / 64.0);
        let a = net().forward_pass(batch.view()).unwrap();
        let b = net().forward_pass(batch.view()).unwrap();
        assert_eq!(a.output, b.output);
    }

    #[test]
    fn test_relu_is_non_negative() {
        let batch = Array4::from_shape_fn((1, 1, 8, 8), |(_, _, y, x)| y as f32 - x as f32);
        let pass = net().forward_pass(batch.view()).unwrap();
        assert!(pass.activations[1].iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_wrong_input_shape_rejected() {
        let batch = Array4::<f32>::zeros((1, 2, 8, 8));
        assert!(net().forward_pass(batch.view()).is_err());
    }
}
