//! Spatial realignment of layer activations.
//!
//! An [`ActivationAlignment`] is built once from the activation shapes of a
//! trial forward pass. Layers with `N x C x H x W` activations are kept;
//! every other layer is dropped from the aligned views. Kept layers are
//! resampled with the same centered affine map used on the inputs, with the
//! translation rescaled to the layer's resolution.

use crate::error::{MeasureError, Result};
use crate::transformation::AffineTransformation;
use ndarray::{ArrayD, Ix4};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
struct AlignedLayer {
    /// Position in the model's layer list.
    source: usize,
    name: String,
    /// `(x, y)` factor mapping input pixels onto this layer's grid.
    translation_scale: (f64, f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivationAlignment {
    input_size: (usize, usize),
    model_layers: usize,
    kept: Vec<AlignedLayer>,
}

impl ActivationAlignment {
    /// Classify layers from the shapes of one forward pass over an input of
    /// `input_size = (height, width)`.
    pub fn from_shapes(
        layer_names: &[String],
        shapes: &[Vec<usize>],
        input_size: (usize, usize),
    ) -> Result<Self> {
        if layer_names.len() != shapes.len() {
            return Err(MeasureError::shape_mismatch(
                "alignment layer count",
                &[layer_names.len()],
                &[shapes.len()],
            ));
        }
        let (height, width) = input_size;
        let mut kept = Vec::new();
        for (source, (name, shape)) in layer_names.iter().zip(shapes).enumerate() {
            if shape.len() != 4 {
                debug!(layer = %name, shape = ?shape, "layer is not spatial, dropped from alignment");
                continue;
            }
            let translation_scale = (
                ratio(shape[3], width),
                ratio(shape[2], height),
            );
            debug!(layer = %name, shape = ?shape, scale = ?translation_scale, "aligning layer");
            kept.push(AlignedLayer {
                source,
                name: name.clone(),
                translation_scale,
            });
        }
        Ok(Self {
            input_size,
            model_layers: layer_names.len(),
            kept,
        })
    }

    pub fn input_size(&self) -> (usize, usize) {
        self.input_size
    }

    /// Names of the kept layers, in model order.
    pub fn layer_names(&self) -> Vec<String> {
        self.kept.iter().map(|l| l.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.kept.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }

    /// Keep only the spatial layers of a full per-layer activation list.
    pub fn filter(&self, mut activations: Vec<ArrayD<f32>>) -> Result<Vec<ArrayD<f32>>> {
        if activations.len() != self.model_layers {
            return Err(MeasureError::shape_mismatch(
                "activations per forward pass",
                &[self.model_layers],
                &[activations.len()],
            ));
        }
        let mut out = Vec::with_capacity(self.kept.len());
        for layer in &self.kept {
            out.push(std::mem::take(&mut activations[layer.source]));
        }
        Ok(out)
    }

    /// Apply one transformation to every row of every (filtered) layer.
    pub fn align_per_group(
        &self,
        activations: Vec<ArrayD<f32>>,
        transformation: &AffineTransformation,
    ) -> Result<Vec<ArrayD<f32>>> {
        self.align_with(activations, |_| transformation)
    }

    /// Apply `transformations[i]` to row `i` of every (filtered) layer.
    pub fn align_per_row(
        &self,
        activations: Vec<ArrayD<f32>>,
        transformations: &[AffineTransformation],
    ) -> Result<Vec<ArrayD<f32>>> {
        for a in &activations {
            if a.shape().first() != Some(&transformations.len()) {
                return Err(MeasureError::shape_mismatch(
                    "per-row alignment",
                    &[transformations.len()],
                    &a.shape()[..a.ndim().min(1)],
                ));
            }
        }
        self.align_with(activations, |row| &transformations[row])
    }

    fn align_with<'t, F>(&self, activations: Vec<ArrayD<f32>>, pick: F) -> Result<Vec<ArrayD<f32>>>
    where
        F: Fn(usize) -> &'t AffineTransformation,
    {
        if activations.len() != self.kept.len() {
            return Err(MeasureError::shape_mismatch(
                "aligned layer count",
                &[self.kept.len()],
                &[activations.len()],
            ));
        }
        activations
            .into_iter()
            .zip(&self.kept)
            .map(|(a, layer)| {
                let shape = a.shape().to_vec();
                let mut maps = a.into_dimensionality::<Ix4>().map_err(|_| {
                    MeasureError::shape_mismatch(
                        format!("spatial layer {}", layer.name),
                        &[0, 0, 0, 0],
                        &shape,
                    )
                })?;
                for (row, mut map) in maps.outer_iter_mut().enumerate() {
                    let aligned = pick(row).apply_scaled(map.view(), layer.translation_scale);
                    map.assign(&aligned);
                }
                Ok(maps.into_dyn())
            })
            .collect()
    }
}

fn ratio(layer: usize, input: usize) -> f64 {
    if input == 0 {
        1.0
    } else {
        layer as f64 / input as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array4, IxDyn};

    fn names(n: &[&str]) -> Vec<String> {
        n.iter().map(|s| s.to_string()).collect()
    }

    fn plan() -> ActivationAlignment {
        ActivationAlignment::from_shapes(
            &names(&["conv", "fc", "pool"]),
            &[vec![1, 2, 8, 8], vec![1, 10], vec![1, 2, 4, 4]],
            (8, 8),
        )
        .unwrap()
    }

    #[test]
    fn test_non_spatial_layers_dropped() {
        let alignment = plan();
        assert_eq!(alignment.layer_names(), names(&["conv", "pool"]));
        assert_eq!(alignment.kept[1].translation_scale, (0.5, 0.5));
    }

    #[test]
    fn test_filter_keeps_model_order() {
        let alignment = plan();
        let acts = vec![
            ArrayD::from_elem(IxDyn(&[3, 2, 8, 8]), 1.0f32),
            Array2::<f32>::zeros((3, 10)).into_dyn(),
            ArrayD::from_elem(IxDyn(&[3, 2, 4, 4]), 2.0f32),
        ];
        let kept = alignment.filter(acts).unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].shape(), &[3, 2, 8, 8]);
        assert_eq!(kept[1][[0, 0, 0, 0]], 2.0);
    }

    #[test]
    fn test_per_row_uses_row_transformation() {
        let alignment = ActivationAlignment::from_shapes(
            &names(&["map"]),
            &[vec![1, 1, 4, 4]],
            (4, 4),
        )
        .unwrap();
        let acts = vec![Array4::from_shape_fn((2, 1, 4, 4), |(_, _, y, x)| (y * 4 + x) as f32).into_dyn()];
        let shift = AffineTransformation::generate(0.0, (1.0, 0.0), (1.0, 1.0));
        let rows = [AffineTransformation::identity(), shift];
        let out = alignment.align_per_row(acts.clone(), &rows).unwrap();
        // row 0 untouched, row 1 shifted one column right
        assert_eq!(out[0][[0, 0, 2, 3]], acts[0][[0, 0, 2, 3]]);
        assert_eq!(out[0][[1, 0, 2, 0]], 0.0);
        assert_eq!(out[0][[1, 0, 2, 3]], acts[0][[1, 0, 2, 2]]);
    }

    #[test]
    fn test_per_row_length_checked() {
        let alignment = plan();
        let acts = vec![
            ArrayD::<f32>::zeros(IxDyn(&[2, 2, 8, 8])),
            ArrayD::<f32>::zeros(IxDyn(&[2, 2, 4, 4])),
        ];
        let err = alignment
            .align_per_row(acts, &[AffineTransformation::identity()])
            .unwrap_err();
        assert!(matches!(err, MeasureError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_translation_rescaled_on_smaller_maps() {
        let alignment = plan();
        let acts = vec![
            ArrayD::<f32>::zeros(IxDyn(&[1, 2, 8, 8])),
            Array4::from_shape_fn((1, 2, 4, 4), |(_, _, y, x)| (y * 4 + x) as f32).into_dyn(),
        ];
        // two input pixels become one pixel on the 4x4 map
        let t = AffineTransformation::generate(0.0, (2.0, 0.0), (1.0, 1.0));
        let out = alignment.align_per_group(acts.clone(), &t).unwrap();
        assert_eq!(out[1][[0, 0, 1, 0]], 0.0);
        assert_eq!(out[1][[0, 0, 1, 2]], acts[1][[0, 0, 1, 1]]);
    }
}
