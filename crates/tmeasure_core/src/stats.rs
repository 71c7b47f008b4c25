//! Online statistics over streams of same-shaped arrays.
//!
//! Both accumulators use Welford's incremental update. A raw sum of squares
//! is never formed: activation magnitudes can be large enough for
//! `E[x^2] - E[x]^2` to cancel catastrophically.
//!
//! `update_all` walks the rows of a batch one at a time, which keeps the
//! working set at one row regardless of batch size.

use crate::error::{MeasureError, Result};
use ndarray::{ArrayD, ArrayViewD, Zip};

/// Running mean, variance and standard deviation.
#[derive(Debug, Clone, Default)]
pub struct RunningStatistic {
    count: u64,
    mean: Option<ArrayD<f64>>,
    m2: Option<ArrayD<f64>>,
}

impl RunningStatistic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one observation into the accumulator.
    pub fn update<A>(&mut self, x: ArrayViewD<'_, A>) -> Result<()>
    where
        A: Copy + Into<f64>,
    {
        let (mean, m2) = match (&mut self.mean, &mut self.m2) {
            (Some(mean), Some(m2)) => {
                if mean.shape() != x.shape() {
                    return Err(MeasureError::shape_mismatch(
                        "running statistic update",
                        mean.shape(),
                        x.shape(),
                    ));
                }
                (mean, m2)
            }
            _ => {
                self.count = 1;
                self.mean = Some(x.mapv(Into::into));
                self.m2 = Some(ArrayD::zeros(x.raw_dim()));
                return Ok(());
            }
        };

        self.count += 1;
        let n = self.count as f64;
        Zip::from(mean).and(m2).and(&x).for_each(|mu, s, &v| {
            let v: f64 = v.into();
            let delta = v - *mu;
            *mu += delta / n;
            *s += delta * (v - *mu);
        });
        Ok(())
    }

    /// Same as calling [`Self::update`] on every row of `batch`, in row order.
    pub fn update_all<A>(&mut self, batch: ArrayViewD<'_, A>) -> Result<()>
    where
        A: Copy + Into<f64>,
    {
        if batch.ndim() == 0 {
            return Err(MeasureError::shape_mismatch(
                "running statistic batch",
                &[1],
                batch.shape(),
            ));
        }
        for row in batch.outer_iter() {
            self.update(row)?;
        }
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<&ArrayD<f64>> {
        self.mean.as_ref()
    }

    /// Sample variance `M2 / (n - 1)`; zero while `n <= 1`.
    pub fn var(&self) -> Option<ArrayD<f64>> {
        let m2 = self.m2.as_ref()?;
        if self.count <= 1 {
            return Some(ArrayD::zeros(m2.raw_dim()));
        }
        let denom = (self.count - 1) as f64;
        Some(m2.mapv(|s| s / denom))
    }

    pub fn std(&self) -> Option<ArrayD<f64>> {
        self.var().map(|v| v.mapv(f64::sqrt))
    }
}

/// Mean-only accumulator for indicator streams such as firing rates.
#[derive(Debug, Clone, Default)]
pub struct RunningMean {
    count: u64,
    mean: Option<ArrayD<f64>>,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update<A>(&mut self, x: ArrayViewD<'_, A>) -> Result<()>
    where
        A: Copy + Into<f64>,
    {
        let mean = match &mut self.mean {
            Some(mean) => {
                if mean.shape() != x.shape() {
                    return Err(MeasureError::shape_mismatch(
                        "running mean update",
                        mean.shape(),
                        x.shape(),
                    ));
                }
                mean
            }
            None => {
                self.count = 1;
                self.mean = Some(x.mapv(Into::into));
                return Ok(());
            }
        };

        self.count += 1;
        let n = self.count as f64;
        Zip::from(mean).and(&x).for_each(|mu, &v| {
            let v: f64 = v.into();
            *mu += (v - *mu) / n;
        });
        Ok(())
    }

    pub fn update_all<A>(&mut self, batch: ArrayViewD<'_, A>) -> Result<()>
    where
        A: Copy + Into<f64>,
    {
        if batch.ndim() == 0 {
            return Err(MeasureError::shape_mismatch(
                "running mean batch",
                &[1],
                batch.shape(),
            ));
        }
        for row in batch.outer_iter() {
            self.update(row)?;
        }
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<&ArrayD<f64>> {
        self.mean.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, ArrayD, IxDyn};

    fn assert_close(a: &ArrayD<f64>, b: &ArrayD<f64>, tol: f64) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() <= tol, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_known_moments() {
        let mut stat = RunningStatistic::new();
        for v in [2.0f32, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            stat.update(arr1(&[v]).into_dyn().view()).unwrap();
        }
        assert_eq!(stat.count(), 8);
        assert!((stat.mean().unwrap()[[0]] - 5.0).abs() < 1e-12);
        // sample variance with ddof = 1
        assert!((stat.var().unwrap()[[0]] - 32.0 / 7.0).abs() < 1e-12);
        assert!((stat.std().unwrap()[[0]] - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_single_observation_has_zero_variance() {
        let mut stat = RunningStatistic::new();
        stat.update(arr1(&[3.0f32, -1.0]).into_dyn().view()).unwrap();
        assert_eq!(stat.var().unwrap(), ArrayD::<f64>::zeros(IxDyn(&[2])));
    }

    #[test]
    fn test_empty_accumulator() {
        let stat = RunningStatistic::new();
        assert!(stat.mean().is_none());
        assert!(stat.var().is_none());
        assert_eq!(RunningMean::new().count(), 0);
    }

    #[test]
    fn test_update_all_matches_rowwise() {
        let rows: Vec<Vec<f32>> = (0..25)
            .map(|i| vec![(i as f32 * 0.37).sin() * 100.0, i as f32, 1e4 - i as f32])
            .collect();
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        let batch = ArrayD::from_shape_vec(IxDyn(&[25, 3]), flat).unwrap();

        let mut one_by_one = RunningStatistic::new();
        for row in &rows {
            one_by_one
                .update(arr1(row).into_dyn().view())
                .unwrap();
        }
        let mut batched = RunningStatistic::new();
        batched.update_all(batch.view()).unwrap();

        assert_close(one_by_one.mean().unwrap(), batched.mean().unwrap(), 1e-6);
        assert_close(&one_by_one.var().unwrap(), &batched.var().unwrap(), 1e-6);
    }

    #[test]
    fn test_large_offset_is_stable() {
        let mut stat = RunningStatistic::new();
        for i in 0..1000 {
            let v = 1e9 + if i % 2 == 0 { 1.0 } else { -1.0 };
            stat.update(arr1(&[v]).into_dyn().view()).unwrap();
        }
        let var = stat.var().unwrap()[[0]];
        // 1000 alternating +-1 samples: M2 = 1000, var = 1000 / 999
        assert!((var - 1000.0 / 999.0).abs() < 1e-6, "var = {}", var);
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let mut stat = RunningStatistic::new();
        stat.update(arr1(&[1.0f32, 2.0]).into_dyn().view()).unwrap();
        let err = stat
            .update(arr2(&[[1.0f32, 2.0]]).into_dyn().view())
            .unwrap_err();
        assert!(matches!(err, MeasureError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_running_mean_of_indicators() {
        let mut mean = RunningMean::new();
        let batch = arr2(&[[1.0f64, 0.0], [0.0, 0.0], [1.0, 1.0], [1.0, 0.0]]).into_dyn();
        mean.update_all(batch.view()).unwrap();
        assert_eq!(mean.count(), 4);
        assert_close(mean.mean().unwrap(), &arr1(&[0.75, 0.25]).into_dyn(), 1e-12);
    }
}
