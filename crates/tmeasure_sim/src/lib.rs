//! Synthetic harness for tmeasure.
//!
//! Supplies a seeded convolutional network and an oriented-bar image
//! dataset, and runs measure lists described in TOML against them.

pub mod dataset;
pub mod experiment;
pub mod model;

pub use dataset::{DatasetConfig, SyntheticImages};
pub use experiment::{run_experiment, ExperimentConfig, ExperimentReport, MeasureSpec};
pub use model::{ModelConfig, SyntheticConvNet};
