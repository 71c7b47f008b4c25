//! Collaborator interfaces consumed by the engine.
//!
//! Models and datasets are supplied by the caller. They are only ever read,
//! so implementations must be shareable across threads.

use crate::error::{MeasureError, Result};
use ndarray::{Array3, Array4, ArrayD, ArrayView4, Axis};
use std::collections::BTreeMap;

/// Output of one forward evaluation.
#[derive(Debug, Clone)]
pub struct ForwardPass {
    /// Final model output, first axis is the batch row.
    pub output: ArrayD<f32>,
    /// One tensor per observable layer, in `layer_names()` order.
    pub activations: Vec<ArrayD<f32>>,
}

/// A network whose intermediate layers can be observed.
pub trait ObservableModel: Sync {
    /// Observable layers, in the order `forward_pass` reports them.
    fn layer_names(&self) -> Vec<String>;

    /// Evaluate an `N x C x H x W` batch.
    fn forward_pass(&self, batch: ArrayView4<'_, f32>) -> anyhow::Result<ForwardPass>;
}

/// Indexable collection of labelled `C x H x W` images with a stable order.
pub trait ImageDataset: Sync {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> anyhow::Result<(Array3<f32>, usize)>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Label of sample `index`. Override when labels are cheaper than images.
    fn label(&self, index: usize) -> anyhow::Result<usize> {
        Ok(self.get(index)?.1)
    }
}

impl<T: ImageDataset + ?Sized> ImageDataset for &T {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> anyhow::Result<(Array3<f32>, usize)> {
        (**self).get(index)
    }

    fn label(&self, index: usize) -> anyhow::Result<usize> {
        (**self).label(index)
    }
}

/// Index view over the samples of a dataset that share one label.
#[derive(Debug)]
pub struct DatasetSubset<'a, D: ?Sized> {
    dataset: &'a D,
    label: usize,
    indices: Vec<usize>,
}

impl<'a, D: ImageDataset + ?Sized> DatasetSubset<'a, D> {
    pub fn new(dataset: &'a D, label: usize, indices: Vec<usize>) -> Self {
        Self {
            dataset,
            label,
            indices,
        }
    }

    pub fn label_value(&self) -> usize {
        self.label
    }

    /// Positions of the subset's samples in the parent dataset.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl<D: ImageDataset + ?Sized> ImageDataset for DatasetSubset<'_, D> {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn get(&self, index: usize) -> anyhow::Result<(Array3<f32>, usize)> {
        let parent = *self.indices.get(index).ok_or_else(|| {
            anyhow::anyhow!(
                "subset index {} out of range for {} samples",
                index,
                self.indices.len()
            )
        })?;
        self.dataset.get(parent)
    }

    fn label(&self, _index: usize) -> anyhow::Result<usize> {
        Ok(self.label)
    }
}

/// Split `dataset` into one subset per label, ordered by label.
pub fn stratify<D: ImageDataset + ?Sized>(dataset: &D) -> Result<Vec<DatasetSubset<'_, D>>> {
    let mut by_label: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for index in 0..dataset.len() {
        by_label.entry(dataset.label(index)?).or_default().push(index);
    }
    Ok(by_label
        .into_iter()
        .map(|(label, indices)| DatasetSubset::new(dataset, label, indices))
        .collect())
}

/// Load `indices` from `dataset` and stack them into an `N x C x H x W` batch.
pub(crate) fn load_batch<D: ImageDataset + ?Sized>(
    dataset: &D,
    indices: &[usize],
) -> Result<Array4<f32>> {
    let mut images: Vec<Array3<f32>> = Vec::with_capacity(indices.len());
    for &index in indices {
        let (image, _) = dataset.get(index)?;
        if let Some(first) = images.first() {
            if first.shape() != image.shape() {
                return Err(MeasureError::shape_mismatch(
                    format!("dataset sample {}", index),
                    first.shape(),
                    image.shape(),
                ));
            }
        }
        images.push(image);
    }
    Ok(stack_images(&images))
}

pub(crate) fn stack_images(images: &[Array3<f32>]) -> Array4<f32> {
    let (c, h, w) = images.first().map(|i| i.dim()).unwrap_or((0, 0, 0));
    let mut batch = Array4::<f32>::zeros((images.len(), c, h, w));
    for (image, mut row) in images.iter().zip(batch.axis_iter_mut(Axis(0))) {
        row.assign(image);
    }
    batch
}
