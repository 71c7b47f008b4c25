//! Small deterministic collaborators shared by the integration suites.
#![allow(dead_code)]

use ndarray::{Array2, Array3, ArrayView4, Axis};
use tmeasure_core::{ForwardPass, ImageDataset, ObservableModel};

/// Three observable layers:
/// - `identity`: the input itself (`N x C x H x W`)
/// - `center`: the centre pixel of every channel (`N x C`), exactly
///   invariant under centred rotations of odd-sized images
/// - `row_sums`: per-row sums over channels and columns (`N x H`)
pub struct PassthroughModel;

impl ObservableModel for PassthroughModel {
    fn layer_names(&self) -> Vec<String> {
        vec!["identity".into(), "center".into(), "row_sums".into()]
    }

    fn forward_pass(&self, batch: ArrayView4<'_, f32>) -> anyhow::Result<ForwardPass> {
        let (n, c, h, w) = batch.dim();
        let center = Array2::from_shape_fn((n, c), |(i, ch)| batch[[i, ch, h / 2, w / 2]]);
        let row_sums = Array2::from_shape_fn((n, h), |(i, y)| {
            batch
                .index_axis(Axis(0), i)
                .index_axis(Axis(1), y)
                .sum()
        });
        Ok(ForwardPass {
            output: row_sums.clone().into_dyn(),
            activations: vec![
                batch.to_owned().into_dyn(),
                center.into_dyn(),
                row_sums.into_dyn(),
            ],
        })
    }
}

/// `len` pseudo-random images of size `channels x size x size`, labels cycling
/// through `classes`.
pub struct PatternDataset {
    pub len: usize,
    pub channels: usize,
    pub size: usize,
    pub classes: usize,
}

impl PatternDataset {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            channels: 2,
            size: 7,
            classes: 2,
        }
    }
}

impl ImageDataset for PatternDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> anyhow::Result<(Array3<f32>, usize)> {
        if index >= self.len {
            anyhow::bail!("sample {} out of range", index);
        }
        let image = Array3::from_shape_fn((self.channels, self.size, self.size), |(c, y, x)| {
            ((index * 31 + c * 5 + y * 7 + x * 13) % 17) as f32 / 17.0
        });
        Ok((image, index % self.classes))
    }
}
