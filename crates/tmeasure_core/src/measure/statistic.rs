//! Grouped statistics: variance under transformation and across samples.
//!
//! Both measures keep one [`RunningStatistic`] per group, read a
//! [`MeasureFunction`] from it when the group ends, and average that value
//! over all groups with a [`RunningMean`].

use super::{measure_id, no_values, ConvAggregation, Measure, MeasureFunction, MeasureResult};
use crate::config::ActivationsOrder;
use crate::error::Result;
use crate::executor::{GroupMarker, LayerMeasure, LayerOutput, PerLayerMeasure, PerLayerMeasureExecutor};
use crate::iterator::{ActivationsIterator, LayerBatch};
use crate::model::{ImageDataset, ObservableModel};
use crate::stats::{RunningMean, RunningStatistic};
use serde::{Deserialize, Serialize};

/// Spread of each neuron over the transformations of a fixed sample,
/// averaged over samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransformationStatistic {
    #[serde(default)]
    pub function: MeasureFunction,
    #[serde(default)]
    pub aggregation: ConvAggregation,
}

/// Spread of each neuron over the samples of a fixed transformation,
/// averaged over transformations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SampleStatistic {
    #[serde(default)]
    pub function: MeasureFunction,
    #[serde(default)]
    pub aggregation: ConvAggregation,
}

impl TransformationStatistic {
    pub fn new(function: MeasureFunction, aggregation: ConvAggregation) -> Self {
        Self {
            function,
            aggregation,
        }
    }
}

impl SampleStatistic {
    pub fn new(function: MeasureFunction, aggregation: ConvAggregation) -> Self {
        Self {
            function,
            aggregation,
        }
    }
}

#[derive(Debug, Default)]
pub struct GroupedStatisticLayer {
    function: MeasureFunction,
    aggregation: ConvAggregation,
    group: RunningStatistic,
    across: RunningMean,
}

impl GroupedStatisticLayer {
    fn new(function: MeasureFunction, aggregation: ConvAggregation) -> Self {
        Self {
            function,
            aggregation,
            ..Self::default()
        }
    }
}

impl LayerMeasure for GroupedStatisticLayer {
    fn begin_group(&mut self, _marker: GroupMarker) -> Result<()> {
        self.group = RunningStatistic::new();
        Ok(())
    }

    fn update(&mut self, batch: LayerBatch) -> Result<()> {
        let values = self.aggregation.prepare(&batch.activations);
        self.group.update_all(values.view())
    }

    fn end_group(&mut self) -> Result<()> {
        if let Some(value) = self.function.apply(&self.group) {
            self.across.update(value.view())?;
        }
        Ok(())
    }

    fn finish(self) -> Result<LayerOutput> {
        let values = self.across.mean().cloned().unwrap_or_else(no_values);
        Ok(LayerOutput::new(values))
    }
}

impl PerLayerMeasure for TransformationStatistic {
    type Layer = GroupedStatisticLayer;

    fn id(&self) -> String {
        measure_id(&format!("Transformation{}", self.function), self.aggregation)
    }

    fn order(&self) -> ActivationsOrder {
        ActivationsOrder::SamplesFirst
    }

    fn layer_measure(&self, _index: usize, _name: &str) -> Result<GroupedStatisticLayer> {
        Ok(GroupedStatisticLayer::new(self.function, self.aggregation))
    }
}

impl PerLayerMeasure for SampleStatistic {
    type Layer = GroupedStatisticLayer;

    fn id(&self) -> String {
        measure_id(&format!("Sample{}", self.function), self.aggregation)
    }

    fn order(&self) -> ActivationsOrder {
        ActivationsOrder::TransformationsFirst
    }

    fn layer_measure(&self, _index: usize, _name: &str) -> Result<GroupedStatisticLayer> {
        Ok(GroupedStatisticLayer::new(self.function, self.aggregation))
    }
}

impl Measure for TransformationStatistic {
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

impl Measure for SampleStatistic {
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
