//! Mean pairwise distance between the activations of a group.
//!
//! A group's rows are buffered until the group ends, then every feature
//! gets the mean Euclidean distance over all row pairs. That value is
//! averaged over groups like the grouped statistics are.
//!
//! - [`TransformationDistance`]: groups are samples (spread under transformation)
//! - [`SampleDistance`]: groups are transformations (spread across samples)
//! - [`DistanceEquivariance`]: transformation distance on activations mapped
//!   back onto the untransformed frame

use super::{no_values, Measure, MeasureResult, QuotientMeasure};
use crate::config::{ActivationsOrder, IteratorVariant};
use crate::error::{MeasureError, Result};
use crate::executor::{GroupMarker, LayerMeasure, LayerOutput, PerLayerMeasure, PerLayerMeasureExecutor};
use crate::iterator::{ActivationsIterator, LayerBatch};
use crate::model::{ImageDataset, ObservableModel};
use crate::stats::RunningMean;
use core::fmt;
use ndarray::{concatenate, Array1, Array3, ArrayD, ArrayViewD, Axis, IxDyn};
use serde::{Deserialize, Serialize};

/// How a group of activation rows is reduced to one distance per feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DistanceAggregation {
    /// Min-max scale every feature element over the group's rows first.
    #[serde(default)]
    pub normalize: bool,
    /// Treat each `H x W` feature map as one vector instead of `H * W`
    /// separate features.
    #[serde(default)]
    pub keep_feature_maps: bool,
}

impl DistanceAggregation {
    pub fn new(normalize: bool, keep_feature_maps: bool) -> Self {
        Self {
            normalize,
            keep_feature_maps,
        }
    }

    /// Mean Euclidean distance over all row pairs of an `N x ...` group.
    ///
    /// Feature-map layers (`N x C x H x W`) give `C` values when maps are
    /// kept whole and `C x H x W` values otherwise; any other layer gives
    /// one value per element of a row. Fewer than two rows give zeros.
    pub fn apply(&self, rows: ArrayViewD<'_, f64>) -> Result<ArrayD<f64>> {
        let shape = rows.shape().to_vec();
        if shape.len() < 2 {
            return Err(MeasureError::shape_mismatch(
                "distance rows",
                &[shape.first().copied().unwrap_or(0), 1],
                &shape,
            ));
        }
        let n = shape[0];
        let (features, dims, out_shape) = if shape.len() == 4 && self.keep_feature_maps {
            (shape[1], shape[2] * shape[3], vec![shape[1]])
        } else {
            let out = shape[1..].to_vec();
            (out.iter().product(), 1, out)
        };

        let mut x: Array3<f64> = rows
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((n, features, dims))
            .map_err(|_| MeasureError::shape_mismatch("distance rows", &[n, features, dims], &shape))?;

        if self.normalize {
            for mut column in x.lanes_mut(Axis(0)) {
                let min = column.fold(f64::INFINITY, |m, &v| m.min(v));
                let max = column.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
                let range = if max - min > 0.0 { max - min } else { 1.0 };
                column.mapv_inplace(|v| (v - min) / range);
            }
        }

        let pairs = n * n.saturating_sub(1) / 2;
        let mut distances = Array1::<f64>::zeros(features);
        if pairs > 0 {
            for (f, d) in distances.iter_mut().enumerate() {
                let feature = x.index_axis(Axis(1), f);
                let mut total = 0.0;
                for i in 0..n {
                    for j in (i + 1)..n {
                        let diff = &feature.row(i) - &feature.row(j);
                        total += diff.dot(&diff).sqrt();
                    }
                }
                *d = total / pairs as f64;
            }
        }

        distances
            .into_shape_with_order(IxDyn(&out_shape))
            .map_err(|_| MeasureError::shape_mismatch("distance output", &out_shape, &[features]))
    }
}

impl fmt::Display for DistanceAggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DA(normalize={},keep_feature_maps={})",
            self.normalize, self.keep_feature_maps
        )
    }
}

/// Buffers one group's rows and feeds its distances into a running mean.
#[derive(Debug, Default)]
pub struct GroupedDistanceLayer {
    aggregation: DistanceAggregation,
    group: Vec<ArrayD<f64>>,
    across: RunningMean,
}

impl GroupedDistanceLayer {
    fn new(aggregation: DistanceAggregation) -> Self {
        Self {
            aggregation,
            ..Self::default()
        }
    }
}

impl LayerMeasure for GroupedDistanceLayer {
    fn begin_group(&mut self, _marker: GroupMarker) -> Result<()> {
        self.group.clear();
        Ok(())
    }

    fn update(&mut self, batch: LayerBatch) -> Result<()> {
        self.group.push(batch.activations.mapv(f64::from));
        Ok(())
    }

    fn end_group(&mut self) -> Result<()> {
        if self.group.is_empty() {
            return Ok(());
        }
        let views: Vec<ArrayViewD<'_, f64>> = self.group.iter().map(|b| b.view()).collect();
        let rows = concatenate(Axis(0), &views).map_err(|_| {
            MeasureError::shape_mismatch("group rows", self.group[0].shape(), &[])
        })?;
        let distances = self.aggregation.apply(rows.view())?;
        self.group.clear();
        self.across.update(distances.view())
    }

    fn finish(self) -> Result<LayerOutput> {
        Ok(LayerOutput::new(
            self.across.mean().cloned().unwrap_or_else(no_values),
        ))
    }
}

/// Distance between the transformed copies of each sample, averaged over samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransformationDistance {
    #[serde(default)]
    pub aggregation: DistanceAggregation,
}

/// Distance between the samples under each transformation, averaged over
/// transformations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SampleDistance {
    #[serde(default)]
    pub aggregation: DistanceAggregation,
}

/// Transformation distance of realigned activations. A perfectly
/// equivariant layer yields 0. Needs the `Inverted` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DistanceEquivariance {
    #[serde(default)]
    pub aggregation: DistanceAggregation,
}

impl TransformationDistance {
    pub fn new(aggregation: DistanceAggregation) -> Self {
        Self { aggregation }
    }
}

impl SampleDistance {
    pub fn new(aggregation: DistanceAggregation) -> Self {
        Self { aggregation }
    }
}

impl DistanceEquivariance {
    pub fn new(aggregation: DistanceAggregation) -> Self {
        Self { aggregation }
    }
}

/// Transformation distance normalized by sample distance.
pub fn normalized_distance(
    aggregation: DistanceAggregation,
) -> QuotientMeasure<TransformationDistance, SampleDistance> {
    QuotientMeasure::new(
        TransformationDistance::new(aggregation),
        SampleDistance::new(aggregation),
    )
}

impl PerLayerMeasure for TransformationDistance {
    type Layer = GroupedDistanceLayer;

    fn id(&self) -> String {
        format!("TransformationDistance({})", self.aggregation)
    }

    fn order(&self) -> ActivationsOrder {
        ActivationsOrder::SamplesFirst
    }

    fn layer_measure(&self, _index: usize, _name: &str) -> Result<GroupedDistanceLayer> {
        Ok(GroupedDistanceLayer::new(self.aggregation))
    }
}

impl PerLayerMeasure for SampleDistance {
    type Layer = GroupedDistanceLayer;

    fn id(&self) -> String {
        format!("SampleDistance({})", self.aggregation)
    }

    fn order(&self) -> ActivationsOrder {
        ActivationsOrder::TransformationsFirst
    }

    fn layer_measure(&self, _index: usize, _name: &str) -> Result<GroupedDistanceLayer> {
        Ok(GroupedDistanceLayer::new(self.aggregation))
    }
}

impl PerLayerMeasure for DistanceEquivariance {
    type Layer = GroupedDistanceLayer;

    fn id(&self) -> String {
        format!("DistanceEquivariance({})", self.aggregation)
    }

    fn order(&self) -> ActivationsOrder {
        ActivationsOrder::SamplesFirst
    }

    fn layer_measure(&self, _index: usize, _name: &str) -> Result<GroupedDistanceLayer> {
        Ok(GroupedDistanceLayer::new(self.aggregation))
    }
}

impl Measure for TransformationDistance {
    fn id(&self) -> String {
        PerLayerMeasure::id(self)
    }

    fn eval<M, D>(
        &self,
        iterator: &ActivationsIterator<'_, M, D>,
        executor: &PerLayerMeasureExecutor,
    ) -> Result<MeasureResult>
    where
        M: ObservableModel + ?Sized,
        D: ImageDataset + ?Sized,
    {
        executor.evaluate(iterator, self)
    }
}

impl Measure for SampleDistance {
    fn id(&self) -> String {
        PerLayerMeasure::id(self)
    }

    fn eval<M, D>(
        &self,
        iterator: &ActivationsIterator<'_, M, D>,
        executor: &PerLayerMeasureExecutor,
    ) -> Result<MeasureResult>
    where
        M: ObservableModel + ?Sized,
        D: ImageDataset + ?Sized,
    {
        executor.evaluate(iterator, self)
    }
}

impl Measure for DistanceEquivariance {
    fn id(&self) -> String {
        PerLayerMeasure::id(self)
    }

    fn eval<M, D>(
        &self,
        iterator: &ActivationsIterator<'_, M, D>,
        executor: &PerLayerMeasureExecutor,
    ) -> Result<MeasureResult>
    where
        M: ObservableModel + ?Sized,
        D: ImageDataset + ?Sized,
    {
        if iterator.variant() != IteratorVariant::Inverted {
            return Err(MeasureError::config(
                "variant",
                format!(
                    "{} needs the inverted variant, iterator uses {:?}",
                    Measure::id(self),
                    iterator.variant()
                ),
            ));
        }
        executor.evaluate(iterator, self)
    }
}
