//! Quotient composition of two measures.
//!
//! Division uses a fixed zero policy with `eps = 0`:
//!
//! | denominator | numerator | result |
//! |---|---|---|
//! | `> eps` | any | `num / den` |
//! | `<= eps` | `<= eps` | `1` |
//! | `<= eps` | `> eps` | `+inf` |

use super::{
    zip_map, ConvAggregation, Measure, MeasureFunction, MeasureResult, SampleStatistic,
    TransformationStatistic,
};
use crate::error::{MeasureError, Result};
use crate::executor::PerLayerMeasureExecutor;
use crate::iterator::ActivationsIterator;
use crate::model::{ImageDataset, ObservableModel};
use ndarray::ArrayD;
use tracing::info;

const EPS: f64 = 0.0;

fn divide(numerator: f64, denominator: f64) -> f64 {
    if denominator > EPS {
        numerator / denominator
    } else if numerator > EPS {
        f64::INFINITY
    } else {
        1.0
    }
}

/// Elementwise quotient of two same-shaped layer arrays.
pub fn divide_layers(numerator: &ArrayD<f64>, denominator: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    zip_map("quotient", numerator, denominator, divide)
}

/// Layer-by-layer quotient of two results over the same layers.
pub fn divide_results(
    numerator: &MeasureResult,
    denominator: &MeasureResult,
    measure: String,
) -> Result<MeasureResult> {
    if numerator.layer_names != denominator.layer_names {
        return Err(MeasureError::config(
            "layer_names",
            format!(
                "numerator {} and denominator {} report different layers",
                numerator.measure, denominator.measure
            ),
        ));
    }
    let layers = numerator
        .layers
        .iter()
        .zip(&denominator.layers)
        .map(|(n, d)| divide_layers(n, d))
        .collect::<Result<Vec<_>>>()?;
    MeasureResult::new(layers, numerator.layer_names.clone(), measure)
}

/// `numerator / denominator`, both evaluated on the same iterator.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotientMeasure<N, D> {
    pub numerator: N,
    pub denominator: D,
}

impl<N: Measure, D: Measure> QuotientMeasure<N, D> {
    pub fn new(numerator: N, denominator: D) -> Self {
        Self {
            numerator,
            denominator,
        }
    }
}

impl<N: Measure, Q: Measure> Measure for QuotientMeasure<N, Q> {
    fn id(&self) -> String {
        format!("{}_DIV_{}", self.numerator.id(), self.denominator.id())
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
        let denominator = self.denominator.eval(iterator, executor)?;
        let numerator = self.numerator.eval(iterator, executor)?;
        let result = divide_results(&numerator, &denominator, self.id())?;
        info!(measure = %result.measure, average = result.average(), "quotient evaluated");
        Ok(result
            .with_auxiliary("numerator", numerator)
            .with_auxiliary("denominator", denominator))
    }
}

/// Variance under transformation normalized by variance across samples.
pub fn normalized_variance(
    aggregation: ConvAggregation,
) -> QuotientMeasure<TransformationStatistic, SampleStatistic> {
    QuotientMeasure::new(
        TransformationStatistic::new(MeasureFunction::Var, aggregation),
        SampleStatistic::new(MeasureFunction::Var, aggregation),
    )
}
