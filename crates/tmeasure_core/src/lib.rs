//! tmeasure: transformation-invariance measures for neural network layers
//!
//! Streams a model's per-layer activations over every (sample,
//! transformation) pair and aggregates them into per-neuron statistics:
//! - `transformation`: deterministic affine transformation sets
//! - `stats`: Welford running mean / variance
//! - `iterator`: lazy samples-first and transformations-first traversals,
//!   with optional spatial realignment of activations
//! - `executor`: one worker thread per layer fed through bounded channels
//! - `measure`: grouped statistics and distances, quotient normalization,
//!   firing rates
//!
//! The model and the dataset are supplied by the caller through
//! [`ObservableModel`] and [`ImageDataset`].

pub mod config;
pub mod error;
pub mod executor;
pub mod iterator;
pub mod measure;
pub mod model;
pub mod stats;
pub mod transformation;

pub use config::{ActivationsOrder, ExecutorConfig, IteratorConfig, IteratorVariant};
pub use error::{MeasureError, Result};
pub use executor::{
    GroupMarker, LayerMeasure, LayerOutcome, LayerOutput, PerLayerMeasure,
    PerLayerMeasureExecutor,
};
pub use iterator::{ActivationBatch, ActivationGroup, ActivationsIterator, LayerBatch};
pub use measure::{
    normalized_distance, normalized_variance, AlignmentDistance, ConvAggregation,
    DistanceAggregation, DistanceEquivariance, FiringRateMeasure, Measure, MeasureFunction,
    MeasureResult, QuotientMeasure, SampleDistance, SampleStatistic, Sign, StratifiedMeasure,
    TransformationDistance, TransformationStatistic,
};
pub use model::{stratify, DatasetSubset, ForwardPass, ImageDataset, ObservableModel};
pub use stats::{RunningMean, RunningStatistic};
pub use transformation::{AffineParameters, AffineTransformation, SimpleSetSizes, TransformationSet};
