//! Lazy traversal of a model's activations over (sample, transformation) pairs.
//!
//! [`ActivationsIterator`] binds a model, a dataset and a transformation set
//! and exposes two traversals of the same cross product:
//!
//! - [`ActivationsIterator::samples_first`]: one group per dataset sample,
//!   batches of transformed copies of that sample in set order.
//! - [`ActivationsIterator::transformations_first`]: one group per
//!   transformation, fixed-order dataset batches. A trailing incomplete
//!   batch is dropped.
//!
//! Nothing is materialized ahead of time. Each batch is built, transformed
//! and evaluated when it is pulled, so memory stays bounded by one batch.
//! Calling a traversal again restarts it from the beginning.

mod alignment;

pub use alignment::ActivationAlignment;

use crate::config::{ActivationsOrder, IteratorConfig, IteratorVariant};
use crate::error::{MeasureError, Result};
use crate::model::{load_batch, ImageDataset, ObservableModel};
use crate::transformation::{AffineTransformation, TransformationSet};
use ndarray::{Array3, Array4, ArrayD, ArrayView4, Axis, IxDyn};
use std::ops::Range;
use tracing::debug;

/// One forward-evaluated batch.
#[derive(Debug, Clone)]
pub struct ActivationBatch {
    /// The (transformed) images that were evaluated.
    pub inputs: Array4<f32>,
    /// Dataset index of every row.
    pub sample_indices: Vec<usize>,
    /// Transformation index of every row.
    pub transformation_indices: Vec<usize>,
    /// Per-layer activations, in the iterator's `layer_names()` order.
    pub activations: Vec<ArrayD<f32>>,
    /// Untransformed-input activations aligned row by row with
    /// `activations`. Only present for [`IteratorVariant::Both`].
    pub baseline: Option<Vec<ArrayD<f32>>>,
}

impl ActivationBatch {
    pub fn len(&self) -> usize {
        self.sample_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_indices.is_empty()
    }

    /// `(sample, transformation)` index pair of every row.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.sample_indices
            .iter()
            .copied()
            .zip(self.transformation_indices.iter().copied())
    }

    /// Split into one batch per layer.
    pub fn into_layers(self) -> Vec<LayerBatch> {
        let mut baselines = self.baseline.map(Vec::into_iter);
        self.activations
            .into_iter()
            .map(|activations| LayerBatch {
                activations,
                baseline: baselines.as_mut().and_then(Iterator::next),
            })
            .collect()
    }
}

/// The slice of an [`ActivationBatch`] belonging to one layer.
#[derive(Debug, Clone)]
pub struct LayerBatch {
    pub activations: ArrayD<f32>,
    pub baseline: Option<ArrayD<f32>>,
}

impl LayerBatch {
    pub fn rows(&self) -> usize {
        self.activations.shape().first().copied().unwrap_or(0)
    }
}

/// A group yielded by either traversal.
pub trait ActivationGroup {
    type Batches: Iterator<Item = Result<ActivationBatch>>;

    /// Sample index (samples-first) or transformation index (transformations-first).
    fn index(&self) -> usize;

    fn into_batches(self) -> Self::Batches;
}

pub struct ActivationsIterator<'a, M: ?Sized, D: ?Sized> {
    model: &'a M,
    dataset: &'a D,
    transformations: &'a TransformationSet,
    config: IteratorConfig,
    model_layers: usize,
    layer_names: Vec<String>,
    alignment: Option<ActivationAlignment>,
}

impl<'a, M, D> ActivationsIterator<'a, M, D>
where
    M: ObservableModel + ?Sized,
    D: ImageDataset + ?Sized,
{
    /// Validate `config` and, for the aligned variants, run the model once on
    /// the first dataset sample to learn which layers are spatial.
    pub fn build(
        model: &'a M,
        dataset: &'a D,
        transformations: &'a TransformationSet,
        config: IteratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let names = model.layer_names();
        let model_layers = names.len();

        let alignment = match config.variant {
            IteratorVariant::Normal => None,
            IteratorVariant::Inverted | IteratorVariant::Both => {
                if dataset.is_empty() {
                    return Err(MeasureError::EmptyDataset);
                }
                let (first, _) = dataset.get(0)?;
                let (_, height, width) = first.dim();
                let pass = model.forward_pass(first.view().insert_axis(Axis(0)))?;
                let shapes: Vec<Vec<usize>> = pass
                    .activations
                    .iter()
                    .map(|a| a.shape().to_vec())
                    .collect();
                Some(ActivationAlignment::from_shapes(
                    &names,
                    &shapes,
                    (height, width),
                )?)
            }
        };

        let layer_names = match &alignment {
            Some(a) => a.layer_names(),
            None => names,
        };
        debug!(
            variant = ?config.variant,
            batch_size = config.batch_size,
            layers = layer_names.len(),
            transformations = transformations.len(),
            samples = dataset.len(),
            "activations iterator built"
        );

        Ok(Self {
            model,
            dataset,
            transformations,
            config,
            model_layers,
            layer_names,
            alignment,
        })
    }

    pub fn model(&self) -> &'a M {
        self.model
    }

    pub fn dataset(&self) -> &'a D {
        self.dataset
    }

    pub fn transformations(&self) -> &'a TransformationSet {
        self.transformations
    }

    pub fn config(&self) -> &IteratorConfig {
        &self.config
    }

    pub fn variant(&self) -> IteratorVariant {
        self.config.variant
    }

    /// Layers reported in every batch. Aligned variants list spatial layers only.
    pub fn layer_names(&self) -> &[String] {
        &self.layer_names
    }

    pub fn alignment(&self) -> Option<&ActivationAlignment> {
        self.alignment.as_ref()
    }

    /// Number of (sample, transformation) rows a full traversal yields.
    pub fn observation_count(&self, order: ActivationsOrder) -> usize {
        let n = self.dataset.len();
        let t = self.transformations.len();
        match order {
            ActivationsOrder::SamplesFirst => n * t,
            ActivationsOrder::TransformationsFirst => {
                (n / self.config.batch_size) * self.config.batch_size * t
            }
        }
    }

    pub fn samples_first(&self) -> SamplesFirst<'_, 'a, M, D> {
        SamplesFirst {
            iterator: self,
            next_sample: 0,
        }
    }

    pub fn transformations_first(&self) -> TransformationsFirst<'_, 'a, M, D> {
        TransformationsFirst {
            iterator: self,
            next_transformation: 0,
        }
    }

    fn aligned(&self) -> Result<&ActivationAlignment> {
        self.alignment.as_ref().ok_or_else(|| {
            MeasureError::config("variant", "aligned activations requested without an alignment")
        })
    }

    fn forward(&self, batch: ArrayView4<'_, f32>) -> Result<Vec<ArrayD<f32>>> {
        let rows = batch.len_of(Axis(0));
        let pass = self.model.forward_pass(batch)?;
        if pass.activations.len() != self.model_layers {
            return Err(MeasureError::shape_mismatch(
                "activations per forward pass",
                &[self.model_layers],
                &[pass.activations.len()],
            ));
        }
        for a in &pass.activations {
            if a.shape().first() != Some(&rows) {
                return Err(MeasureError::shape_mismatch(
                    "activation batch rows",
                    &[rows],
                    a.shape(),
                ));
            }
        }
        Ok(pass.activations)
    }

    fn sample_group(&self, sample_index: usize) -> Result<SampleGroup<'_, 'a, M, D>> {
        let (sample, label) = self.dataset.get(sample_index)?;
        let baseline = match self.config.variant {
            IteratorVariant::Both => {
                let acts = self.forward(sample.view().insert_axis(Axis(0)))?;
                Some(self.aligned()?.filter(acts)?)
            }
            _ => None,
        };
        Ok(SampleGroup {
            iterator: self,
            sample_index,
            label,
            sample,
            baseline,
        })
    }

    fn sample_batch(
        &self,
        sample_index: usize,
        sample: &Array3<f32>,
        baseline: Option<&[ArrayD<f32>]>,
        range: Range<usize>,
    ) -> Result<ActivationBatch> {
        let ts = &self.transformations.as_slice()[range.clone()];
        let (c, h, w) = sample.dim();
        let mut inputs = Array4::<f32>::zeros((ts.len(), c, h, w));
        for (t, mut row) in ts.iter().zip(inputs.outer_iter_mut()) {
            row.assign(&t.apply(sample.view()));
        }
        let activations = self.forward(inputs.view())?;

        let (activations, baseline) = match self.config.variant {
            IteratorVariant::Normal => (activations, None),
            IteratorVariant::Inverted => {
                let alignment = self.aligned()?;
                let inverses: Vec<AffineTransformation> = ts.iter().map(|t| t.inverse()).collect();
                let aligned = alignment.align_per_row(alignment.filter(activations)?, &inverses)?;
                (aligned, None)
            }
            IteratorVariant::Both => {
                let alignment = self.aligned()?;
                let baseline = baseline.ok_or_else(|| {
                    MeasureError::config("variant", "baseline activations missing for sample group")
                })?;
                let replicated = replicate_rows(baseline, ts.len())?;
                let baseline = alignment.align_per_row(replicated, ts)?;
                (alignment.filter(activations)?, Some(baseline))
            }
        };

        Ok(ActivationBatch {
            inputs,
            sample_indices: vec![sample_index; range.len()],
            transformation_indices: range.collect(),
            activations,
            baseline,
        })
    }

    fn transformation_batch(
        &self,
        index: usize,
        transformation: &AffineTransformation,
        batch: usize,
    ) -> Result<ActivationBatch> {
        let size = self.config.batch_size;
        let indices: Vec<usize> = (batch * size..(batch + 1) * size).collect();
        let raw = load_batch(self.dataset, &indices)?;
        let inputs = transformation.apply_batch(raw.view());
        let activations = self.forward(inputs.view())?;

        let (activations, baseline) = match self.config.variant {
            IteratorVariant::Normal => (activations, None),
            IteratorVariant::Inverted => {
                let alignment = self.aligned()?;
                let aligned = alignment
                    .align_per_group(alignment.filter(activations)?, &transformation.inverse())?;
                (aligned, None)
            }
            IteratorVariant::Both => {
                let alignment = self.aligned()?;
                let untransformed = alignment.filter(self.forward(raw.view())?)?;
                let baseline = alignment.align_per_group(untransformed, transformation)?;
                (alignment.filter(activations)?, Some(baseline))
            }
        };

        Ok(ActivationBatch {
            inputs,
            transformation_indices: vec![index; indices.len()],
            sample_indices: indices,
            activations,
            baseline,
        })
    }
}

/// Copy single-row activations into `rows` identical rows.
fn replicate_rows(layers: &[ArrayD<f32>], rows: usize) -> Result<Vec<ArrayD<f32>>> {
    layers
        .iter()
        .map(|a| {
            let mut shape = a.shape().to_vec();
            if shape.first() != Some(&1) {
                return Err(MeasureError::shape_mismatch("baseline rows", &[1], a.shape()));
            }
            shape[0] = rows;
            a.broadcast(IxDyn(&shape))
                .map(|view| view.to_owned())
                .ok_or_else(|| MeasureError::shape_mismatch("baseline broadcast", &shape, a.shape()))
        })
        .collect()
}

/// Groups of a samples-first traversal.
pub struct SamplesFirst<'it, 'a, M: ?Sized, D: ?Sized> {
    iterator: &'it ActivationsIterator<'a, M, D>,
    next_sample: usize,
}

impl<'it, 'a, M, D> Iterator for SamplesFirst<'it, 'a, M, D>
where
    M: ObservableModel + ?Sized,
    D: ImageDataset + ?Sized,
{
    type Item = Result<SampleGroup<'it, 'a, M, D>>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.iterator.dataset.len();
        if self.next_sample >= len {
            return None;
        }
        let index = self.next_sample;
        self.next_sample += 1;
        let group = self.iterator.sample_group(index);
        if group.is_err() {
            self.next_sample = len;
        }
        Some(group)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.iterator.dataset.len().saturating_sub(self.next_sample);
        (left, Some(left))
    }
}

/// One dataset sample and its transformed copies.
pub struct SampleGroup<'it, 'a, M: ?Sized, D: ?Sized> {
    iterator: &'it ActivationsIterator<'a, M, D>,
    sample_index: usize,
    label: usize,
    sample: Array3<f32>,
    baseline: Option<Vec<ArrayD<f32>>>,
}

impl<'it, 'a, M, D> SampleGroup<'it, 'a, M, D>
where
    M: ObservableModel + ?Sized,
    D: ImageDataset + ?Sized,
{
    pub fn sample_index(&self) -> usize {
        self.sample_index
    }

    pub fn label(&self) -> usize {
        self.label
    }

    /// The untransformed sample.
    pub fn sample(&self) -> &Array3<f32> {
        &self.sample
    }
}

impl<'it, 'a, M, D> ActivationGroup for SampleGroup<'it, 'a, M, D>
where
    M: ObservableModel + ?Sized,
    D: ImageDataset + ?Sized,
{
    type Batches = SampleBatches<'it, 'a, M, D>;

    fn index(&self) -> usize {
        self.sample_index
    }

    fn into_batches(self) -> Self::Batches {
        SampleBatches {
            group: self,
            cursor: 0,
        }
    }
}

pub struct SampleBatches<'it, 'a, M: ?Sized, D: ?Sized> {
    group: SampleGroup<'it, 'a, M, D>,
    cursor: usize,
}

impl<'it, 'a, M, D> Iterator for SampleBatches<'it, 'a, M, D>
where
    M: ObservableModel + ?Sized,
    D: ImageDataset + ?Sized,
{
    type Item = Result<ActivationBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let iterator = self.group.iterator;
        let total = iterator.transformations.len();
        if self.cursor >= total {
            return None;
        }
        let end = (self.cursor + iterator.config.batch_size).min(total);
        let range = self.cursor..end;
        self.cursor = end;
        let batch = iterator.sample_batch(
            self.group.sample_index,
            &self.group.sample,
            self.group.baseline.as_deref(),
            range,
        );
        if batch.is_err() {
            self.cursor = total;
        }
        Some(batch)
    }
}

/// Groups of a transformations-first traversal.
pub struct TransformationsFirst<'it, 'a, M: ?Sized, D: ?Sized> {
    iterator: &'it ActivationsIterator<'a, M, D>,
    next_transformation: usize,
}

impl<'it, 'a, M, D> Iterator for TransformationsFirst<'it, 'a, M, D>
where
    M: ObservableModel + ?Sized,
    D: ImageDataset + ?Sized,
{
    type Item = Result<TransformationGroup<'it, 'a, M, D>>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next_transformation;
        let transformation = *self.iterator.transformations.get(index)?;
        self.next_transformation += 1;
        Some(Ok(TransformationGroup {
            iterator: self.iterator,
            index,
            transformation,
        }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self
            .iterator
            .transformations
            .len()
            .saturating_sub(self.next_transformation);
        (left, Some(left))
    }
}

/// One transformation applied to the whole dataset.
pub struct TransformationGroup<'it, 'a, M: ?Sized, D: ?Sized> {
    iterator: &'it ActivationsIterator<'a, M, D>,
    index: usize,
    transformation: AffineTransformation,
}

impl<'it, 'a, M, D> TransformationGroup<'it, 'a, M, D>
where
    M: ObservableModel + ?Sized,
    D: ImageDataset + ?Sized,
{
    pub fn transformation_index(&self) -> usize {
        self.index
    }

    pub fn transformation(&self) -> &AffineTransformation {
        &self.transformation
    }
}

impl<'it, 'a, M, D> ActivationGroup for TransformationGroup<'it, 'a, M, D>
where
    M: ObservableModel + ?Sized,
    D: ImageDataset + ?Sized,
{
    type Batches = TransformationBatches<'it, 'a, M, D>;

    fn index(&self) -> usize {
        self.index
    }

    fn into_batches(self) -> Self::Batches {
        let batches = self.iterator.dataset.len() / self.iterator.config.batch_size;
        TransformationBatches {
            group: self,
            next_batch: 0,
            batches,
        }
    }
}

pub struct TransformationBatches<'it, 'a, M: ?Sized, D: ?Sized> {
    group: TransformationGroup<'it, 'a, M, D>,
    next_batch: usize,
    batches: usize,
}

impl<'it, 'a, M, D> Iterator for TransformationBatches<'it, 'a, M, D>
where
    M: ObservableModel + ?Sized,
    D: ImageDataset + ?Sized,
{
    type Item = Result<ActivationBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_batch >= self.batches {
            return None;
        }
        let batch = self.group.iterator.transformation_batch(
            self.group.index,
            &self.group.transformation,
            self.next_batch,
        );
        self.next_batch = if batch.is_err() {
            self.batches
        } else {
            self.next_batch + 1
        };
        Some(batch)
    }
}
