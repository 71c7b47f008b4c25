//! TOML-driven experiments over the synthetic model and dataset.
//!
//! ```toml
//! [dataset]
//! samples = 32
//!
//! [transformations]
//! rotations = 4
//! scales = 0
//! translations = 1
//!
//! [[measures]]
//! kind = "normalized_variance"
//! aggregation = "mean"
//! ```

use crate::dataset::{DatasetConfig, SyntheticImages};
use crate::model::{ModelConfig, SyntheticConvNet};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tmeasure_core::{
    normalized_distance, normalized_variance, ActivationsIterator, AlignmentDistance,
    ConvAggregation, DistanceAggregation, DistanceEquivariance, ExecutorConfig,
    FiringRateMeasure, ImageDataset, IteratorConfig, IteratorVariant, Measure, MeasureFunction,
    MeasureResult, ObservableModel, PerLayerMeasureExecutor, SampleDistance, SampleStatistic,
    Sign, SimpleSetSizes, StratifiedMeasure, TransformationDistance, TransformationSet,
    TransformationStatistic,
};
use tracing::info;

/// One measure to evaluate, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeasureSpec {
    NormalizedVariance {
        #[serde(default)]
        aggregation: ConvAggregation,
    },
    /// Normalized variance evaluated per class and averaged.
    StratifiedNormalizedVariance {
        #[serde(default)]
        aggregation: ConvAggregation,
    },
    TransformationStatistic {
        #[serde(default)]
        function: MeasureFunction,
        #[serde(default)]
        aggregation: ConvAggregation,
    },
    SampleStatistic {
        #[serde(default)]
        function: MeasureFunction,
        #[serde(default)]
        aggregation: ConvAggregation,
    },
    FiringRate {
        #[serde(default = "default_alpha")]
        alpha: f64,
        #[serde(default)]
        sign: Sign,
    },
    /// Always evaluated with the `both` iterator variant.
    AlignmentDistance {
        #[serde(default)]
        aggregation: ConvAggregation,
    },
    TransformationDistance {
        #[serde(default)]
        normalize: bool,
        #[serde(default)]
        keep_feature_maps: bool,
    },
    SampleDistance {
        #[serde(default)]
        normalize: bool,
        #[serde(default)]
        keep_feature_maps: bool,
    },
    NormalizedDistance {
        #[serde(default)]
        normalize: bool,
        #[serde(default)]
        keep_feature_maps: bool,
    },
    /// Always evaluated with the `inverted` iterator variant.
    DistanceEquivariance {
        #[serde(default)]
        normalize: bool,
        #[serde(default)]
        keep_feature_maps: bool,
    },
}

fn default_alpha() -> f64 {
    0.99
}

impl MeasureSpec {
    /// Iterator settings this measure runs with.
    pub fn iterator_config(&self, base: &IteratorConfig) -> IteratorConfig {
        match self {
            MeasureSpec::AlignmentDistance { .. } => base.clone().with_variant(IteratorVariant::Both),
            MeasureSpec::DistanceEquivariance { .. } => {
                base.clone().with_variant(IteratorVariant::Inverted)
            }
            _ => base.clone(),
        }
    }

    pub fn evaluate<M, D>(
        &self,
        iterator: &ActivationsIterator<'_, M, D>,
        executor: &PerLayerMeasureExecutor,
    ) -> Result<MeasureResult>
    where
        M: ObservableModel + ?Sized,
        D: ImageDataset + ?Sized,
    {
        let result = match *self {
            MeasureSpec::NormalizedVariance { aggregation } => {
                normalized_variance(aggregation).eval(iterator, executor)
            }
            MeasureSpec::StratifiedNormalizedVariance { aggregation } => {
                StratifiedMeasure::new(normalized_variance(aggregation)).eval(iterator, executor)
            }
            MeasureSpec::TransformationStatistic {
                function,
                aggregation,
            } => TransformationStatistic::new(function, aggregation).eval(iterator, executor),
            MeasureSpec::SampleStatistic {
                function,
                aggregation,
            } => SampleStatistic::new(function, aggregation).eval(iterator, executor),
            MeasureSpec::FiringRate { alpha, sign } => {
                FiringRateMeasure::new(alpha, sign)?.eval(iterator, executor)
            }
            MeasureSpec::AlignmentDistance { aggregation } => {
                AlignmentDistance::new(aggregation).eval(iterator, executor)
            }
            MeasureSpec::TransformationDistance {
                normalize,
                keep_feature_maps,
            } => TransformationDistance::new(DistanceAggregation::new(normalize, keep_feature_maps))
                .eval(iterator, executor),
            MeasureSpec::SampleDistance {
                normalize,
                keep_feature_maps,
            } => SampleDistance::new(DistanceAggregation::new(normalize, keep_feature_maps))
                .eval(iterator, executor),
            MeasureSpec::NormalizedDistance {
                normalize,
                keep_feature_maps,
            } => normalized_distance(DistanceAggregation::new(normalize, keep_feature_maps))
                .eval(iterator, executor),
            MeasureSpec::DistanceEquivariance {
                normalize,
                keep_feature_maps,
            } => DistanceEquivariance::new(DistanceAggregation::new(normalize, keep_feature_maps))
                .eval(iterator, executor),
        };
        Ok(result?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default = "default_transformations")]
    pub transformations: SimpleSetSizes,
    #[serde(default)]
    pub iterator: IteratorConfig,
    #[serde(default = "default_measures")]
    pub measures: Vec<MeasureSpec>,
}

fn default_transformations() -> SimpleSetSizes {
    SimpleSetSizes {
        rotations: 8,
        scales: 0,
        translations: 0,
    }
}

fn default_measures() -> Vec<MeasureSpec> {
    vec![MeasureSpec::NormalizedVariance {
        aggregation: ConvAggregation::Mean,
    }]
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetConfig::default(),
            model: ModelConfig::default(),
            transformations: default_transformations(),
            iterator: IteratorConfig::default(),
            measures: default_measures(),
        }
    }
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading experiment config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ExperimentConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.dataset.validate()?;
        self.iterator.validate()?;
        if self.measures.is_empty() {
            bail!("experiment lists no measures");
        }
        Ok(())
    }
}

/// Everything one run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub transformations: String,
    /// Content digest of the transformation set.
    pub digest: String,
    pub transformation_count: usize,
    pub results: Vec<MeasureResult>,
}

pub fn run_experiment(config: &ExperimentConfig, executor: ExecutorConfig) -> Result<ExperimentReport> {
    config.validate()?;
    let executor = PerLayerMeasureExecutor::new(executor)?;

    let dataset = SyntheticImages::generate(&config.dataset)?;
    let model = SyntheticConvNet::new(&config.model, dataset.image_shape(), dataset.classes())?;
    let set = TransformationSet::from_sizes(config.transformations);
    info!(
        transformations = set.id(),
        count = set.len(),
        samples = dataset.len(),
        "experiment ready"
    );

    let mut results = Vec::with_capacity(config.measures.len());
    for measure in &config.measures {
        let iterator =
            ActivationsIterator::build(&model, &dataset, &set, measure.iterator_config(&config.iterator))?;
        let started = Instant::now();
        let result = measure
            .evaluate(&iterator, &executor)
            .with_context(|| format!("evaluating {:?}", measure))?;
        info!(
            measure = %result.measure,
            average = result.average(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "measure evaluated"
        );
        results.push(result);
    }

    Ok(ExperimentReport {
        transformations: set.id().to_string(),
        digest: set.digest(),
        transformation_count: set.len(),
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = ExperimentConfig::from_toml_str("").unwrap();
        assert_eq!(config.dataset.samples, 64);
        assert_eq!(config.transformations.rotations, 8);
        assert_eq!(config.iterator.batch_size, 32);
        assert_eq!(config.measures, default_measures());
    }

    #[test]
    fn test_tagged_measures() {
        let text = r#"
            [[measures]]
            kind = "firing_rate"
            alpha = 0.9
            sign = -1

            [[measures]]
            kind = "sample_statistic"
            function = "std"
            aggregation = "max"
        "#;
        let config = ExperimentConfig::from_toml_str(text).unwrap();
        assert_eq!(
            config.measures,
            vec![
                MeasureSpec::FiringRate {
                    alpha: 0.9,
                    sign: Sign::Negative
                },
                MeasureSpec::SampleStatistic {
                    function: MeasureFunction::Std,
                    aggregation: ConvAggregation::Max
                },
            ]
        );
    }

    #[test]
    fn test_alignment_distance_forces_both() {
        let spec = MeasureSpec::AlignmentDistance {
            aggregation: ConvAggregation::None,
        };
        let base = IteratorConfig::default();
        assert_eq!(spec.iterator_config(&base).variant, IteratorVariant::Both);
        let equivariance = MeasureSpec::DistanceEquivariance {
            normalize: true,
            keep_feature_maps: true,
        };
        assert_eq!(
            equivariance.iterator_config(&base).variant,
            IteratorVariant::Inverted
        );
        let other = MeasureSpec::NormalizedVariance {
            aggregation: ConvAggregation::None,
        };
        assert_eq!(other.iterator_config(&base).variant, IteratorVariant::Normal);
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let text = r#"
            [[measures]]
            kind = "entropy"
        "#;
        assert!(ExperimentConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn test_rejects_zero_batch() {
        let text = r#"
            [iterator]
            batch_size = 0
        "#;
        assert!(ExperimentConfig::from_toml_str(text).is_err());
    }
}
