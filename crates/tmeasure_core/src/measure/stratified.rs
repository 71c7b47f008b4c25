//! Per-class evaluation of a measure.

use super::{Measure, MeasureResult};
use crate::error::{MeasureError, Result};
use crate::executor::PerLayerMeasureExecutor;
use crate::iterator::ActivationsIterator;
use crate::model::{stratify, ImageDataset, ObservableModel};
use tracing::info;

/// Evaluates `inner` once per label and averages the per-class results.
/// Each class result is kept as auxiliary output `class_<label>`.
#[derive(Debug, Clone, PartialEq)]
pub struct StratifiedMeasure<I> {
    pub inner: I,
}

impl<I: Measure> StratifiedMeasure<I> {
    pub fn new(inner: I) -> Self {
        Self { inner }
    }
}

impl<I: Measure> Measure for StratifiedMeasure<I> {
    fn id(&self) -> String {
        format!("Stratified({})", self.inner.id())
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
        let classes = stratify(iterator.dataset())?;
        if classes.is_empty() {
            return Err(MeasureError::EmptyDataset);
        }

        let mut per_class = Vec::with_capacity(classes.len());
        for subset in &classes {
            let class_iterator = ActivationsIterator::build(
                iterator.model(),
                subset,
                iterator.transformations(),
                iterator.config().clone(),
            )?;
            let result = self.inner.eval(&class_iterator, executor)?;
            info!(
                measure = %result.measure,
                label = subset.label_value(),
                samples = subset.len(),
                "class evaluated"
            );
            per_class.push((subset.label_value(), result));
        }

        let results: Vec<MeasureResult> = per_class.iter().map(|(_, r)| r.clone()).collect();
        let mut combined = MeasureResult::mean_of(&results, self.id())?;
        for (label, result) in per_class {
            combined = combined.with_auxiliary(format!("class_{}", label), result);
        }
        Ok(combined)
    }
}
