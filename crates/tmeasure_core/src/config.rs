use crate::error::{MeasureError, Result};
use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

#[cfg(feature = "cli")]
use clap::{Args, ValueEnum};

/// Grouping of the (sample, transformation) cross product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum ActivationsOrder {
    /// Outer loop over samples, inner loop over transformations.
    SamplesFirst,
    /// Outer loop over transformations, inner loop over dataset batches.
    TransformationsFirst,
}

impl fmt::Display for ActivationsOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationsOrder::SamplesFirst => write!(f, "samples_first"),
            ActivationsOrder::TransformationsFirst => write!(f, "transformations_first"),
        }
    }
}

impl FromStr for ActivationsOrder {
    type Err = MeasureError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "samples_first" | "samples" => Ok(ActivationsOrder::SamplesFirst),
            "transformations_first" | "transformations" => {
                Ok(ActivationsOrder::TransformationsFirst)
            }
            other => Err(MeasureError::config(
                "activations_order",
                format!("unknown traversal order '{}'", other),
            )),
        }
    }
}

/// Which activations an iterator hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum IteratorVariant {
    /// Raw forward-pass activations.
    #[default]
    Normal,
    /// Spatial activations mapped back onto the untransformed frame.
    Inverted,
    /// Transformed-input activations plus the aligned untransformed baseline.
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(Args))]
pub struct IteratorConfig {
    /// Number of images per forward pass
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 32))]
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Activations variant (Normal, Inverted, Both)
    #[cfg_attr(feature = "cli", arg(long, value_enum, default_value_t = IteratorVariant::Normal))]
    #[serde(default)]
    pub variant: IteratorVariant,
}

fn default_batch_size() -> usize {
    32
}

impl Default for IteratorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            variant: IteratorVariant::Normal,
        }
    }
}

impl IteratorConfig {
    pub fn with_variant(mut self, variant: IteratorVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(MeasureError::config("batch_size", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(Args))]
pub struct ExecutorConfig {
    /// Bounded capacity of each producer -> layer worker channel
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 4))]
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    4
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(MeasureError::config(
                "channel_capacity",
                "must be at least 1 to keep back-pressure bounded",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_orders() {
        assert_eq!(
            "samples_first".parse::<ActivationsOrder>().unwrap(),
            ActivationsOrder::SamplesFirst
        );
        assert_eq!(
            "Transformations-First".parse::<ActivationsOrder>().unwrap(),
            ActivationsOrder::TransformationsFirst
        );
    }

    #[test]
    fn test_unknown_order_is_config_error() {
        let err = "diagonal".parse::<ActivationsOrder>().unwrap_err();
        assert!(matches!(err, MeasureError::Config { .. }));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        assert!(IteratorConfig::default().with_batch_size(0).validate().is_err());
        let exec = ExecutorConfig {
            channel_capacity: 0,
        };
        assert!(exec.validate().is_err());
        assert!(ExecutorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_serde_defaults() {
        let cfg: IteratorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.batch_size, 32);
        assert_eq!(cfg.variant, IteratorVariant::Normal);

        let cfg: IteratorConfig = serde_json::from_str(r#"{"variant":"both"}"#).unwrap();
        assert_eq!(cfg.variant, IteratorVariant::Both);
    }
}
