//! Equivariance as a distance between aligned activations.
//!
//! Consumes the `Both` variant: every row pairs the activations of a
//! transformed input with the baseline activations of the untransformed
//! input moved into the same frame. A perfectly equivariant layer yields 0.

use super::{measure_id, no_values, ConvAggregation, Measure, MeasureResult};
use crate::config::{ActivationsOrder, IteratorVariant};
use crate::error::{MeasureError, Result};
use crate::executor::{LayerMeasure, LayerOutput, PerLayerMeasure, PerLayerMeasureExecutor};
use crate::iterator::{ActivationsIterator, LayerBatch};
use crate::model::{ImageDataset, ObservableModel};
use crate::stats::RunningMean;
use serde::{Deserialize, Serialize};

/// Per-neuron mean squared difference between transformed-input and
/// aligned baseline activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlignmentDistance {
    #[serde(default)]
    pub aggregation: ConvAggregation,
}

impl AlignmentDistance {
    pub fn new(aggregation: ConvAggregation) -> Self {
        Self { aggregation }
    }
}

#[derive(Debug, Default)]
pub struct AlignmentDistanceLayer {
    aggregation: ConvAggregation,
    distance: RunningMean,
}

impl LayerMeasure for AlignmentDistanceLayer {
    fn update(&mut self, batch: LayerBatch) -> Result<()> {
        let baseline = batch.baseline.as_ref().ok_or_else(|| {
            MeasureError::config("variant", "alignment distance needs baseline activations")
        })?;
        let transformed = self.aggregation.prepare(&batch.activations);
        let baseline = self.aggregation.prepare(baseline);
        if transformed.shape() != baseline.shape() {
            return Err(MeasureError::shape_mismatch(
                "aligned baseline",
                transformed.shape(),
                baseline.shape(),
            ));
        }
        let mut squared = transformed - &baseline;
        squared.mapv_inplace(|d| d * d);
        self.distance.update_all(squared.view())
    }

    fn finish(self) -> Result<LayerOutput> {
        Ok(LayerOutput::new(
            self.distance.mean().cloned().unwrap_or_else(no_values),
        ))
    }
}

impl PerLayerMeasure for AlignmentDistance {
    type Layer = AlignmentDistanceLayer;

    fn id(&self) -> String {
        measure_id("AlignmentDistance", self.aggregation)
    }

    fn order(&self) -> ActivationsOrder {
        ActivationsOrder::SamplesFirst
    }

    fn layer_measure(&self, _index: usize, _name: &str) -> Result<AlignmentDistanceLayer> {
        Ok(AlignmentDistanceLayer {
            aggregation: self.aggregation,
            distance: RunningMean::new(),
        })
    }
}

impl Measure for AlignmentDistance {
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
        if iterator.variant() != IteratorVariant::Both {
            return Err(MeasureError::config(
                "variant",
                format!(
                    "{} needs the both variant, iterator uses {:?}",
                    Measure::id(self),
                    iterator.variant()
                ),
            ));
        }
        executor.evaluate(iterator, self)
    }
}
