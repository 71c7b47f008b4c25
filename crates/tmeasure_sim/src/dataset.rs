//! Seeded synthetic image dataset.
//!
//! Every class is a bar at a fixed orientation, drawn through the image
//! centre, with additive noise. Rotating an image therefore moves it
//! towards another class, which gives the measures something to find.

use anyhow::{bail, Result};
use ndarray::{Array3, Array4, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tmeasure_core::ImageDataset;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(default = "default_samples")]
    pub samples: usize,
    /// Side length of the square images
    #[serde(default = "default_size")]
    pub size: usize,
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default = "default_classes")]
    pub classes: usize,
    /// Amplitude of the uniform noise added to every pixel
    #[serde(default = "default_noise")]
    pub noise: f32,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_samples() -> usize {
    64
}

fn default_size() -> usize {
    16
}

fn default_channels() -> usize {
    1
}

fn default_classes() -> usize {
    4
}

fn default_noise() -> f32 {
    0.1
}

fn default_seed() -> u64 {
    7
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            samples: default_samples(),
            size: default_size(),
            channels: default_channels(),
            classes: default_classes(),
            noise: default_noise(),
            seed: default_seed(),
        }
    }
}

impl DatasetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.samples == 0 {
            bail!("dataset.samples must be at least 1");
        }
        if self.size < 4 {
            bail!("dataset.size must be at least 4, got {}", self.size);
        }
        if self.channels == 0 || self.classes == 0 {
            bail!("dataset needs at least one channel and one class");
        }
        if !self.noise.is_finite() || self.noise < 0.0 {
            bail!("dataset.noise must be a non-negative number");
        }
        Ok(())
    }
}

/// Pre-generated, in-memory images. Sample `i` has label `i % classes`.
pub struct SyntheticImages {
    images: Array4<f32>,
    labels: Vec<usize>,
    classes: usize,
}

impl SyntheticImages {
    pub fn generate(config: &DatasetConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let (n, c, s) = (config.samples, config.channels, config.size);
        let centre = (s as f64 - 1.0) / 2.0;
        let half_width = (s as f64 / 10.0).max(0.75);

        let labels: Vec<usize> = (0..n).map(|i| i % config.classes).collect();
        let mut images = Array4::<f32>::zeros((n, c, s, s));
        for (i, mut image) in images.outer_iter_mut().enumerate() {
            let angle = PI * labels[i] as f64 / config.classes as f64;
            let (sin, cos) = angle.sin_cos();
            for ((ch, y, x), v) in image.indexed_iter_mut() {
                // distance from the line through the centre at `angle`
                let (dy, dx) = (y as f64 - centre, x as f64 - centre);
                let distance = (dx * sin - dy * cos).abs();
                let bar = if distance <= half_width { 1.0 } else { 0.0 };
                let shade = 1.0 - 0.2 * ch as f32;
                *v = bar * shade + config.noise * rng.gen_range(-1.0f32..1.0);
            }
        }

        Ok(Self {
            images,
            labels,
            classes: config.classes,
        })
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    /// `C x H x W` of every image.
    pub fn image_shape(&self) -> (usize, usize, usize) {
        let (_, c, h, w) = self.images.dim();
        (c, h, w)
    }
}

impl ImageDataset for SyntheticImages {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn get(&self, index: usize) -> Result<(Array3<f32>, usize)> {
        if index >= self.labels.len() {
            bail!("sample {} out of range for {} images", index, self.labels.len());
        }
        Ok((
            self.images.index_axis(Axis(0), index).to_owned(),
            self.labels[index],
        ))
    }

    fn label(&self, index: usize) -> Result<usize> {
        match self.labels.get(index) {
            Some(label) => Ok(*label),
            None => bail!("sample {} out of range for {} images", index, self.labels.len()),
        }
    }
}
