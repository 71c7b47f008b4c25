//! Two-pass global/local firing-rate measure.
//!
//! Pass one fits a per-neuron normal distribution over the whole traversal
//! and places each neuron's firing threshold at its `alpha` quantile. By
//! construction the expected global firing rate is `1 - alpha`. Pass two
//! counts how often each neuron actually reaches its threshold while a
//! single sample is being transformed. The final value is local / global.

use super::{divide_results, no_values, Measure, MeasureResult};
use crate::config::ActivationsOrder;
use crate::error::{MeasureError, Result};
use crate::executor::{LayerMeasure, LayerOutput, PerLayerMeasure, PerLayerMeasureExecutor};
use crate::iterator::{ActivationsIterator, LayerBatch};
use crate::model::{ImageDataset, ObservableModel};
use crate::stats::{RunningMean, RunningStatistic};
use core::fmt;
use ndarray::{ArrayD, Zip};
use probability::distribution::{Gaussian, Inverse};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Activation polarity applied before thresholding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Sign {
    #[default]
    Positive,
    Negative,
}

impl Sign {
    pub fn value(&self) -> f64 {
        match self {
            Sign::Positive => 1.0,
            Sign::Negative => -1.0,
        }
    }
}

impl TryFrom<i32> for Sign {
    type Error = MeasureError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            1 => Ok(Sign::Positive),
            -1 => Ok(Sign::Negative),
            other => Err(MeasureError::config(
                "sign",
                format!("must be 1 or -1, got {}", other),
            )),
        }
    }
}

impl From<Sign> for i32 {
    fn from(sign: Sign) -> i32 {
        match sign {
            Sign::Positive => 1,
            Sign::Negative => -1,
        }
    }
}

impl fmt::Display for Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", i32::from(*self))
    }
}

fn check_alpha(alpha: f64) -> Result<()> {
    if alpha > 0.0 && alpha < 1.0 {
        Ok(())
    } else {
        Err(MeasureError::config(
            "alpha",
            format!("must lie strictly between 0 and 1, got {}", alpha),
        ))
    }
}

/// `alpha` quantile of Normal(mean, std); the mean itself when `std` is 0.
pub fn threshold(mean: f64, std: f64, alpha: f64) -> f64 {
    if std > 0.0 && std.is_finite() {
        Gaussian::new(mean, std).inverse(alpha)
    } else {
        mean
    }
}

/// Pass one: thresholds from a normal fit over all activations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalFiringRate {
    alpha: f64,
    sign: Sign,
}

impl GlobalFiringRate {
    pub fn new(alpha: f64, sign: Sign) -> Result<Self> {
        check_alpha(alpha)?;
        Ok(Self { alpha, sign })
    }
}

#[derive(Debug)]
pub struct GlobalFiringRateLayer {
    alpha: f64,
    sign: f64,
    statistic: RunningStatistic,
}

impl LayerMeasure for GlobalFiringRateLayer {
    fn update(&mut self, batch: LayerBatch) -> Result<()> {
        let sign = self.sign;
        let values = batch.activations.mapv(|a| sign * f64::from(a));
        self.statistic.update_all(values.view())
    }

    fn finish(self) -> Result<LayerOutput> {
        let (Some(mean), Some(std)) = (self.statistic.mean(), self.statistic.std()) else {
            return Ok(LayerOutput::new(no_values()).with_extra("thresholds", no_values()));
        };
        let alpha = self.alpha;
        let thresholds = Zip::from(mean)
            .and(&std)
            .map_collect(|&mu, &sigma| threshold(mu, sigma, alpha));
        let rates = ArrayD::from_elem(mean.raw_dim(), 1.0 - alpha);
        Ok(LayerOutput::new(rates).with_extra("thresholds", thresholds))
    }
}

impl PerLayerMeasure for GlobalFiringRate {
    type Layer = GlobalFiringRateLayer;

    fn id(&self) -> String {
        format!("GlobalFiringRate(alpha={},sign={})", self.alpha, self.sign)
    }

    fn order(&self) -> ActivationsOrder {
        ActivationsOrder::TransformationsFirst
    }

    fn layer_measure(&self, _index: usize, _name: &str) -> Result<GlobalFiringRateLayer> {
        Ok(GlobalFiringRateLayer {
            alpha: self.alpha,
            sign: self.sign.value(),
            statistic: RunningStatistic::new(),
        })
    }
}

/// Pass two: empirical rate of `sign * activation >= threshold`.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalFiringRate {
    thresholds: Vec<ArrayD<f64>>,
    sign: Sign,
}

impl LocalFiringRate {
    /// `thresholds` holds one array per iterator layer.
    pub fn new(thresholds: Vec<ArrayD<f64>>, sign: Sign) -> Self {
        Self { thresholds, sign }
    }
}

#[derive(Debug)]
pub struct LocalFiringRateLayer {
    thresholds: ArrayD<f64>,
    sign: f64,
    rate: RunningMean,
}

impl LayerMeasure for LocalFiringRateLayer {
    fn update(&mut self, batch: LayerBatch) -> Result<()> {
        let sign = self.sign;
        for row in batch.activations.outer_iter() {
            if row.shape() != self.thresholds.shape() {
                return Err(MeasureError::shape_mismatch(
                    "firing thresholds",
                    self.thresholds.shape(),
                    row.shape(),
                ));
            }
            let fired = Zip::from(&row)
                .and(&self.thresholds)
                .map_collect(|&a, &t| if sign * f64::from(a) >= t { 1.0 } else { 0.0 });
            self.rate.update(fired.view())?;
        }
        Ok(())
    }

    fn finish(self) -> Result<LayerOutput> {
        Ok(LayerOutput::new(
            self.rate.mean().cloned().unwrap_or_else(no_values),
        ))
    }
}

impl PerLayerMeasure for LocalFiringRate {
    type Layer = LocalFiringRateLayer;

    fn id(&self) -> String {
        format!("LocalFiringRate(sign={})", self.sign)
    }

    fn order(&self) -> ActivationsOrder {
        ActivationsOrder::SamplesFirst
    }

    fn layer_measure(&self, index: usize, name: &str) -> Result<LocalFiringRateLayer> {
        let thresholds = self.thresholds.get(index).cloned().ok_or_else(|| {
            MeasureError::config("thresholds", format!("no thresholds for layer {}", name))
        })?;
        Ok(LocalFiringRateLayer {
            thresholds,
            sign: self.sign.value(),
            rate: RunningMean::new(),
        })
    }
}

/// Local firing rate normalized by the global one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FiringRateMeasure {
    alpha: f64,
    #[serde(default)]
    sign: Sign,
}

impl FiringRateMeasure {
    pub fn new(alpha: f64, sign: Sign) -> Result<Self> {
        check_alpha(alpha)?;
        Ok(Self { alpha, sign })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn sign(&self) -> Sign {
        self.sign
    }
}

impl Measure for FiringRateMeasure {
    fn id(&self) -> String {
        format!("FiringRate(alpha={},sign={})", self.alpha, self.sign)
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
        let global_measure = GlobalFiringRate::new(self.alpha, self.sign)?;
        let global = executor.evaluate(iterator, &global_measure)?;
        let thresholds = global
            .auxiliary("thresholds")
            .cloned()
            .ok_or_else(|| MeasureError::config("thresholds", "global pass produced none"))?;
        debug!(layers = thresholds.layers.len(), "firing thresholds fitted");

        let local = executor.evaluate(
            iterator,
            &LocalFiringRate::new(thresholds.layers.clone(), self.sign),
        )?;
        let result = divide_results(&local, &global, self.id())?;
        info!(measure = %result.measure, average = result.average(), "firing rate evaluated");
        Ok(result
            .with_auxiliary("global", global)
            .with_auxiliary("local", local)
            .with_auxiliary("thresholds", thresholds))
    }
}

impl Measure for GlobalFiringRate {
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

impl Measure for LocalFiringRate {
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

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array2, IxDyn};

    fn batch(values: Vec<f32>, width: usize) -> LayerBatch {
        let rows = values.len() / width;
        LayerBatch {
            activations: Array2::from_shape_vec((rows, width), values).unwrap().into_dyn(),
            baseline: None,
        }
    }

    #[test]
    fn test_threshold_at_99th_percentile() {
        let global = GlobalFiringRate::new(0.99, Sign::Positive).unwrap();
        let mut layer = global.layer_measure(0, "fc").unwrap();
        // stationary stream with mean 3 and spread 2
        let values: Vec<f32> = (0..1000).map(|i| if i % 2 == 0 { 5.0 } else { 1.0 }).collect();
        layer.update(batch(values, 1)).unwrap();
        let out = layer.finish().unwrap();

        let sigma = 2.0 * (1000.0f64 / 999.0).sqrt();
        let t = out.extras["thresholds"][[0]];
        assert!((t - (3.0 + 2.33 * sigma)).abs() < 0.01 * sigma, "threshold {}", t);
        assert!((out.values[[0]] - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_zero_variance_threshold_is_mean() {
        assert_eq!(threshold(4.0, 0.0, 0.9), 4.0);
        let global = GlobalFiringRate::new(0.5, Sign::Negative).unwrap();
        let mut layer = global.layer_measure(0, "x").unwrap();
        layer.update(batch(vec![2.0, 2.0, 2.0], 1)).unwrap();
        let out = layer.finish().unwrap();
        assert_eq!(out.extras["thresholds"][[0]], -2.0);
    }

    #[test]
    fn test_local_indicator_is_inclusive() {
        let local = LocalFiringRate::new(vec![arr1(&[1.0, 0.0]).into_dyn()], Sign::Positive);
        let mut layer = local.layer_measure(0, "x").unwrap();
        layer.update(batch(vec![1.0, -1.0, 0.5, 0.0, 2.0, 3.0, 0.0, -2.0], 2)).unwrap();
        let out = layer.finish().unwrap();
        assert_eq!(out.values, arr1(&[0.5, 0.5]).into_dyn());
    }

    #[test]
    fn test_sign_flips_polarity() {
        let local = LocalFiringRate::new(vec![arr1(&[0.5]).into_dyn()], Sign::Negative);
        let mut layer = local.layer_measure(0, "x").unwrap();
        layer.update(batch(vec![-1.0, 1.0, -0.5, 0.0], 1)).unwrap();
        assert_eq!(layer.finish().unwrap().values[[0]], 0.5);
    }

    #[test]
    fn test_threshold_shape_checked() {
        let local = LocalFiringRate::new(vec![ArrayD::zeros(IxDyn(&[3]))], Sign::Positive);
        let mut layer = local.layer_measure(0, "x").unwrap();
        assert!(layer.update(batch(vec![1.0, 2.0], 2)).is_err());
        assert!(local.layer_measure(1, "missing").is_err());
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(FiringRateMeasure::new(1.0, Sign::Positive).is_err());
        assert!(FiringRateMeasure::new(0.0, Sign::Positive).is_err());
        assert!(FiringRateMeasure::new(f64::NAN, Sign::Positive).is_err());
        assert!(Sign::try_from(0).is_err());
        assert_eq!(Sign::try_from(-1).unwrap(), Sign::Negative);
    }

    #[test]
    fn test_sign_deserializes_from_integer() {
        let m: FiringRateMeasure = serde_json::from_str(r#"{"alpha":0.9,"sign":-1}"#).unwrap();
        assert_eq!(m.sign(), Sign::Negative);
        assert!(serde_json::from_str::<FiringRateMeasure>(r#"{"alpha":0.9,"sign":2}"#).is_err());
    }
}
