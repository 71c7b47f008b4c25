//! Measures and their results.
//!
//! Every measure is evaluated against an [`ActivationsIterator`] through a
//! [`PerLayerMeasureExecutor`] and produces a [`MeasureResult`]. The set of
//! measures is closed; composition happens through [`QuotientMeasure`],
//! [`FiringRateMeasure`] and [`StratifiedMeasure`].

mod alignment_distance;
mod distance;
mod firing_rate;
mod quotient;
mod statistic;
mod stratified;

pub use alignment_distance::{AlignmentDistance, AlignmentDistanceLayer};
pub use distance::{
    normalized_distance, DistanceAggregation, DistanceEquivariance, GroupedDistanceLayer,
    SampleDistance, TransformationDistance,
};
pub use firing_rate::{
    threshold, FiringRateMeasure, GlobalFiringRate, GlobalFiringRateLayer, LocalFiringRate,
    LocalFiringRateLayer, Sign,
};
pub use quotient::{divide_layers, divide_results, normalized_variance, QuotientMeasure};
pub use statistic::{GroupedStatisticLayer, SampleStatistic, TransformationStatistic};
pub use stratified::StratifiedMeasure;

use crate::error::{MeasureError, Result};
use crate::executor::PerLayerMeasureExecutor;
use crate::iterator::ActivationsIterator;
use crate::model::{ImageDataset, ObservableModel};
use crate::stats::RunningStatistic;
use core::fmt;
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[cfg(feature = "cli")]
use clap::ValueEnum;

pub trait Measure {
    fn id(&self) -> String;

    fn eval<M, D>(
        &self,
        iterator: &ActivationsIterator<'_, M, D>,
        executor: &PerLayerMeasureExecutor,
    ) -> Result<MeasureResult>
    where
        M: ObservableModel + ?Sized,
        D: ImageDataset + ?Sized;
}

/// Per-layer values of one measure evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureResult {
    /// Non-finite values are written as the strings `"inf"`, `"-inf"` and
    /// `"nan"` so JSON output reads back unchanged.
    #[serde(with = "layer_values")]
    pub layers: Vec<ArrayD<f64>>,
    pub layer_names: Vec<String>,
    /// Identity of the measure that produced the values.
    pub measure: String,
    #[serde(default)]
    pub auxiliary: BTreeMap<String, MeasureResult>,
}

impl MeasureResult {
    pub fn new(layers: Vec<ArrayD<f64>>, layer_names: Vec<String>, measure: String) -> Result<Self> {
        if layers.len() != layer_names.len() {
            return Err(MeasureError::shape_mismatch(
                "measure result layers",
                &[layer_names.len()],
                &[layers.len()],
            ));
        }
        Ok(Self {
            layers,
            layer_names,
            measure,
            auxiliary: BTreeMap::new(),
        })
    }

    pub fn with_auxiliary(mut self, name: impl Into<String>, result: MeasureResult) -> Self {
        self.auxiliary.insert(name.into(), result);
        self
    }

    pub fn auxiliary(&self, name: &str) -> Option<&MeasureResult> {
        self.auxiliary.get(name)
    }

    pub fn layer(&self, name: &str) -> Option<&ArrayD<f64>> {
        self.layer_names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.layers[i])
    }

    /// Mean value of each layer; `NaN` for layers without values.
    pub fn layer_averages(&self) -> Vec<f64> {
        self.layers
            .iter()
            .map(|l| l.mean().unwrap_or(f64::NAN))
            .collect()
    }

    /// Mean of the per-layer averages.
    pub fn average(&self) -> f64 {
        let averages = self.layer_averages();
        if averages.is_empty() {
            return f64::NAN;
        }
        averages.iter().sum::<f64>() / averages.len() as f64
    }

    /// Collapse the spatial axes of feature-map layers (`C x H x W`) to one
    /// value per channel. Other layers are left as they are.
    pub fn collapse_spatial(&self, aggregation: ConvAggregation) -> MeasureResult {
        let layers = self
            .layers
            .iter()
            .map(|l| {
                if l.ndim() == 3 {
                    aggregation.collapse(l.view())
                } else {
                    l.clone()
                }
            })
            .collect();
        MeasureResult {
            layers,
            layer_names: self.layer_names.clone(),
            measure: self.measure.clone(),
            auxiliary: self.auxiliary.clone(),
        }
    }

    /// Elementwise mean of several results over the same layers.
    pub fn mean_of(results: &[MeasureResult], measure: String) -> Result<MeasureResult> {
        let first = results.first().ok_or(MeasureError::EmptyDataset)?;
        let mut layers: Vec<ArrayD<f64>> = first.layers.clone();
        for other in &results[1..] {
            if other.layer_names != first.layer_names {
                return Err(MeasureError::config(
                    "layer_names",
                    "results to average disagree on their layers",
                ));
            }
            for (acc, layer) in layers.iter_mut().zip(&other.layers) {
                if acc.shape() != layer.shape() {
                    return Err(MeasureError::shape_mismatch(
                        "mean of results",
                        acc.shape(),
                        layer.shape(),
                    ));
                }
                *acc += layer;
            }
        }
        let n = results.len() as f64;
        for acc in &mut layers {
            acc.mapv_inplace(|v| v / n);
        }
        MeasureResult::new(layers, first.layer_names.clone(), measure)
    }
}

impl fmt::Display for MeasureResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.measure)?;
        for (name, avg) in self.layer_names.iter().zip(self.layer_averages()) {
            write!(f, " {}={:.4}", name, avg)?;
        }
        Ok(())
    }
}

/// Statistic read from a per-group accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum MeasureFunction {
    #[default]
    Var,
    Std,
    Mean,
}

impl MeasureFunction {
    pub fn apply(&self, statistic: &RunningStatistic) -> Option<ArrayD<f64>> {
        match self {
            MeasureFunction::Var => statistic.var(),
            MeasureFunction::Std => statistic.std(),
            MeasureFunction::Mean => statistic.mean().cloned(),
        }
    }
}

impl fmt::Display for MeasureFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasureFunction::Var => write!(f, "Variance"),
            MeasureFunction::Std => write!(f, "StandardDeviation"),
            MeasureFunction::Mean => write!(f, "Mean"),
        }
    }
}

/// How feature maps are reduced to one value per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum ConvAggregation {
    /// Keep every spatial position as its own neuron.
    #[default]
    None,
    Sum,
    Mean,
    Max,
}

impl ConvAggregation {
    /// Reduce the two trailing axes.
    pub fn collapse(&self, values: ArrayViewD<'_, f64>) -> ArrayD<f64> {
        let n = values.ndim();
        if n < 2 || *self == ConvAggregation::None {
            return values.to_owned();
        }
        let (w_axis, h_axis) = (Axis(n - 1), Axis(n - 2));
        match self {
            ConvAggregation::None => values.to_owned(),
            ConvAggregation::Sum => values.sum_axis(w_axis).sum_axis(h_axis),
            ConvAggregation::Mean => {
                let count = (values.len_of(w_axis) * values.len_of(h_axis)) as f64;
                values.sum_axis(w_axis).sum_axis(h_axis).mapv(|s| s / count)
            }
            ConvAggregation::Max => values
                .fold_axis(w_axis, f64::NEG_INFINITY, |&m, &v| m.max(v))
                .fold_axis(h_axis, f64::NEG_INFINITY, |&m, &v| m.max(v)),
        }
    }

    /// Convert a layer batch to `f64`, collapsing `N x C x H x W` maps to
    /// `N x C` when aggregation is enabled.
    pub fn prepare(&self, activations: &ArrayD<f32>) -> ArrayD<f64> {
        let values = activations.mapv(f64::from);
        if activations.ndim() == 4 {
            self.collapse(values.view())
        } else {
            values
        }
    }
}

impl fmt::Display for ConvAggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvAggregation::None => write!(f, "none"),
            ConvAggregation::Sum => write!(f, "sum"),
            ConvAggregation::Mean => write!(f, "mean"),
            ConvAggregation::Max => write!(f, "max"),
        }
    }
}

/// Build an id of the form `Name` or `Name(ca=sum)`.
pub(crate) fn measure_id(name: &str, aggregation: ConvAggregation) -> String {
    match aggregation {
        ConvAggregation::None => name.to_string(),
        other => format!("{}(ca={})", name, other),
    }
}

/// Empty per-layer value for layers that received no observations.
pub(crate) fn no_values() -> ArrayD<f64> {
    ArrayD::zeros(IxDyn(&[0]))
}

/// Check that two arrays share a shape, then map them elementwise.
pub(crate) fn zip_map<F>(
    context: &str,
    a: &ArrayD<f64>,
    b: &ArrayD<f64>,
    f: F,
) -> Result<ArrayD<f64>>
where
    F: Fn(f64, f64) -> f64,
{
    if a.shape() != b.shape() {
        return Err(MeasureError::shape_mismatch(context, a.shape(), b.shape()));
    }
    Ok(Zip::from(a).and(b).map_collect(|&x, &y| f(x, y)))
}

/// Serde encoding of per-layer values as `{ shape, data }` with tagged
/// non-finite entries.
mod layer_values {
    use ndarray::{ArrayD, IxDyn};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Value {
        Number(f64),
        Tagged(String),
    }

    #[derive(Serialize, Deserialize)]
    struct Layer {
        shape: Vec<usize>,
        data: Vec<Value>,
    }

    fn encode(v: f64) -> Value {
        if v.is_nan() {
            Value::Tagged("nan".into())
        } else if v == f64::INFINITY {
            Value::Tagged("inf".into())
        } else if v == f64::NEG_INFINITY {
            Value::Tagged("-inf".into())
        } else {
            Value::Number(v)
        }
    }

    fn decode(v: Value) -> Result<f64, String> {
        match v {
            Value::Number(n) => Ok(n),
            Value::Tagged(tag) => match tag.as_str() {
                "nan" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(format!("unknown layer value '{}'", other)),
            },
        }
    }

    pub fn serialize<S: Serializer>(layers: &[ArrayD<f64>], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded: Vec<Layer> = layers
            .iter()
            .map(|l| Layer {
                shape: l.shape().to_vec(),
                data: l.iter().copied().map(encode).collect(),
            })
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<ArrayD<f64>>, D::Error> {
        Vec::<Layer>::deserialize(deserializer)?
            .into_iter()
            .map(|layer| {
                let data = layer
                    .data
                    .into_iter()
                    .map(decode)
                    .collect::<Result<Vec<f64>, String>>()
                    .map_err(D::Error::custom)?;
                ArrayD::from_shape_vec(IxDyn(&layer.shape), data).map_err(D::Error::custom)
            })
            .collect()
    }
}
