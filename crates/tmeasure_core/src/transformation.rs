//! Affine image transformations and ordered transformation sets.
//!
//! A transformation is parameterized by `(rotation, translation, scale)` and
//! is always applied around the image midpoint:
//! `shift_to_origin -> affine(rotation, translation, scale) -> shift_back`.
//! Resampling is bilinear; samples falling outside the source read as 0.
//!
//! Inversion is algebraic: the angle and the translation are negated and the
//! scale factors replaced by their reciprocals. The inverse is tracked as a
//! flag over the original parameters, so inverting twice gives back the
//! original parameters bit for bit.
//!
//! Sets enumerate the cartesian product rotation (outer) x translation
//! (middle) x scale (inner). Downstream code addresses transformations by
//! their integer position, so this order must never change.

use core::f64::consts::PI;
use core::fmt;
use ndarray::{Array3, Array4, ArrayView3, ArrayView4, Axis};
use serde::{Deserialize, Serialize};

/// Parameters of a centered affine transformation.
///
/// `translation` and `scale` are `(x, y)` pairs in pixel units, x along
/// columns and y along rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineParameters {
    pub rotation: f64,
    pub translation: (f64, f64),
    pub scale: (f64, f64),
}

impl AffineParameters {
    pub const IDENTITY: AffineParameters = AffineParameters {
        rotation: 0.0,
        translation: (0.0, 0.0),
        scale: (1.0, 1.0),
    };

    pub fn new(rotation: f64, translation: (f64, f64), scale: (f64, f64)) -> Self {
        Self {
            rotation,
            translation,
            scale,
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

impl Default for AffineParameters {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// A deterministic, invertible image transformation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransformation {
    base: AffineParameters,
    inverted: bool,
}

impl AffineTransformation {
    pub fn new(parameters: AffineParameters) -> Self {
        Self {
            base: parameters,
            inverted: false,
        }
    }

    /// Build a transformation from its three parameter groups.
    pub fn generate(rotation: f64, translation: (f64, f64), scale: (f64, f64)) -> Self {
        Self::new(AffineParameters::new(rotation, translation, scale))
    }

    pub fn identity() -> Self {
        Self::new(AffineParameters::IDENTITY)
    }

    /// Effective parameters of this transformation.
    pub fn parameters(&self) -> AffineParameters {
        if !self.inverted {
            return self.base;
        }
        let AffineParameters {
            rotation,
            translation: (tx, ty),
            scale: (sx, sy),
        } = self.base;
        AffineParameters {
            rotation: -rotation,
            translation: (-tx, -ty),
            scale: (1.0 / sx, 1.0 / sy),
        }
    }

    /// Algebraic inverse: negated rotation and translation, reciprocal scale.
    pub fn inverse(&self) -> Self {
        Self {
            base: self.base,
            inverted: !self.inverted,
        }
    }

    pub fn is_inverse(&self) -> bool {
        self.inverted
    }

    pub fn is_identity(&self) -> bool {
        self.base.is_identity()
    }

    /// Forward 2x3 matrix mapping source pixel `(x, y)` to destination,
    /// centered on an image of `height x width`. The translation is multiplied
    /// by `translation_scale` so the same transformation can act on feature
    /// maps whose resolution differs from the input image.
    pub fn centered_matrix(
        &self,
        height: usize,
        width: usize,
        translation_scale: (f64, f64),
    ) -> [[f64; 3]; 2] {
        let p = self.parameters();
        let (sin, cos) = p.rotation.sin_cos();
        let (sx, sy) = p.scale;
        let tx = p.translation.0 * translation_scale.0;
        let ty = p.translation.1 * translation_scale.1;
        let cx = (width as f64 - 1.0) / 2.0;
        let cy = (height as f64 - 1.0) / 2.0;

        let a = sx * cos;
        let b = -sy * sin;
        let c = sx * sin;
        let d = sy * cos;

        // T(+center) * A * T(-center)
        [
            [a, b, tx + cx - (a * cx + b * cy)],
            [c, d, ty + cy - (c * cx + d * cy)],
        ]
    }

    /// Transform a `C x H x W` image.
    pub fn apply(&self, image: ArrayView3<'_, f32>) -> Array3<f32> {
        self.apply_scaled(image, (1.0, 1.0))
    }

    /// Transform a `C x H x W` map, rescaling the translation first.
    pub fn apply_scaled(
        &self,
        image: ArrayView3<'_, f32>,
        translation_scale: (f64, f64),
    ) -> Array3<f32> {
        if self.is_identity() {
            return image.to_owned();
        }
        let (channels, height, width) = image.dim();
        let mut out = Array3::<f32>::zeros((channels, height, width));

        let [[a, b, e], [c, d, f]] = self.centered_matrix(height, width, translation_scale);
        let det = a * d - b * c;
        if det.abs() < f64::EPSILON {
            // Collapsed transformation: every output sample lands outside the source.
            return out;
        }
        let (ia, ib, ic, id) = (d / det, -b / det, -c / det, a / det);

        for y in 0..height {
            for x in 0..width {
                let dx = x as f64 - e;
                let dy = y as f64 - f;
                let src_x = ia * dx + ib * dy;
                let src_y = ic * dx + id * dy;
                let taps = bilinear_taps(src_x, src_y, height, width);
                for ch in 0..channels {
                    let mut acc = 0.0f64;
                    for &(row, col, weight) in taps.iter().flatten() {
                        acc += weight * image[[ch, row, col]] as f64;
                    }
                    out[[ch, y, x]] = acc as f32;
                }
            }
        }
        out
    }

    /// Transform every row of an `N x C x H x W` batch.
    pub fn apply_batch(&self, batch: ArrayView4<'_, f32>) -> Array4<f32> {
        let mut out = Array4::<f32>::zeros(batch.raw_dim());
        for (src, mut dst) in batch.outer_iter().zip(out.outer_iter_mut()) {
            dst.assign(&self.apply(src));
        }
        out
    }
}

/// The four bilinear neighbours of `(x, y)` that fall inside the image.
fn bilinear_taps(x: f64, y: f64, height: usize, width: usize) -> [Option<(usize, usize, f64)>; 4] {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let corners = [
        (y0, x0, (1.0 - fx) * (1.0 - fy)),
        (y0, x0 + 1.0, fx * (1.0 - fy)),
        (y0 + 1.0, x0, (1.0 - fx) * fy),
        (y0 + 1.0, x0 + 1.0, fx * fy),
    ];
    corners.map(|(row, col, weight)| {
        let inside = row >= 0.0 && col >= 0.0 && row < height as f64 && col < width as f64;
        if inside && weight > 0.0 {
            Some((row as usize, col as usize, weight))
        } else {
            None
        }
    })
}

impl fmt::Display for AffineTransformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.parameters();
        write!(
            f,
            "Transformation(r={:.4}, t=({}, {}), s=({:.4}, {:.4}))",
            p.rotation, p.translation.0, p.translation.1, p.scale.0, p.scale.1
        )
    }
}

/// Sizes used to generate a [`TransformationSet::simple`] set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SimpleSetSizes {
    pub rotations: usize,
    pub scales: usize,
    pub translations: usize,
}

/// An ordered, finite, re-iterable collection of transformations.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformationSet {
    rotations: Vec<f64>,
    translations: Vec<(f64, f64)>,
    scales: Vec<(f64, f64)>,
    transformations: Vec<AffineTransformation>,
    id: String,
}

impl TransformationSet {
    /// Build the cartesian product of explicit parameter lists.
    ///
    /// Empty lists fall back to the baseline value of that parameter.
    pub fn new(rotations: Vec<f64>, translations: Vec<(f64, f64)>, scales: Vec<(f64, f64)>) -> Self {
        let id = format!("r{:?}_s{:?}_t{:?}", rotations, scales, translations);
        Self::with_id(rotations, translations, scales, id)
    }

    /// The "simple" family: `n_rotations` angles evenly spaced over [-pi, pi),
    /// the baseline scale followed by `n_scales` shrinkage terms, and the
    /// baseline offset followed by the eight compass offsets at each radius
    /// `1..=n_translations`.
    pub fn simple(n_rotations: usize, n_scales: usize, n_translations: usize) -> Self {
        let rotations = (0..n_rotations)
            .map(|i| -PI + 2.0 * PI * i as f64 / n_rotations as f64)
            .collect();

        let mut scales = vec![(1.0, 1.0)];
        let mut shrink = 1.0;
        for _ in 0..n_scales {
            shrink *= 0.5;
            let s = 1.0 - shrink;
            scales.push((s, s));
        }

        let mut translations = vec![(0.0, 0.0)];
        for radius in 1..=n_translations {
            let d = radius as f64;
            // N, S, E, W, NW, NE, SW, SE with rows growing downwards
            translations.extend_from_slice(&[
                (0.0, -d),
                (0.0, d),
                (d, 0.0),
                (-d, 0.0),
                (-d, -d),
                (d, -d),
                (-d, d),
                (d, d),
            ]);
        }

        let id = format!(
            "Affine(r={},s={},t={})",
            n_rotations, n_scales, n_translations
        );
        Self::with_id(rotations, translations, scales, id)
    }

    pub fn from_sizes(sizes: SimpleSetSizes) -> Self {
        Self::simple(sizes.rotations, sizes.scales, sizes.translations)
    }

    /// A set holding only the baseline transformation.
    pub fn identity() -> Self {
        Self::simple(0, 0, 0)
    }

    fn with_id(
        mut rotations: Vec<f64>,
        mut translations: Vec<(f64, f64)>,
        mut scales: Vec<(f64, f64)>,
        id: String,
    ) -> Self {
        if rotations.is_empty() {
            rotations.push(0.0);
        }
        if translations.is_empty() {
            translations.push((0.0, 0.0));
        }
        if scales.is_empty() {
            scales.push((1.0, 1.0));
        }

        let mut transformations =
            Vec::with_capacity(rotations.len() * translations.len() * scales.len());
        for &rotation in &rotations {
            for &translation in &translations {
                for &scale in &scales {
                    transformations.push(AffineTransformation::generate(rotation, translation, scale));
                }
            }
        }

        Self {
            rotations,
            translations,
            scales,
            transformations,
            id,
        }
    }

    /// Stable identity string derived from the parameters.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Short content digest of [`Self::id`], usable as a cache key.
    pub fn digest(&self) -> String {
        let hash = blake3::hash(self.id.as_bytes());
        hash.to_hex()[..16].to_string()
    }

    pub fn len(&self) -> usize {
        self.transformations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformations.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&AffineTransformation> {
        self.transformations.get(index)
    }

    /// Algebraic inverse of the transformation at `index`.
    pub fn inverse(&self, index: usize) -> Option<AffineTransformation> {
        self.transformations.get(index).map(AffineTransformation::inverse)
    }

    pub fn iter(&self) -> core::slice::Iter<'_, AffineTransformation> {
        self.transformations.iter()
    }

    pub fn as_slice(&self) -> &[AffineTransformation] {
        &self.transformations
    }

    pub fn rotations(&self) -> &[f64] {
        &self.rotations
    }

    pub fn translations(&self) -> &[(f64, f64)] {
        &self.translations
    }

    pub fn scales(&self) -> &[(f64, f64)] {
        &self.scales
    }

    /// Transform a single image with every member of the set, in set order.
    pub fn transform_sample(&self, image: ArrayView3<'_, f32>) -> Array4<f32> {
        let (c, h, w) = image.dim();
        let mut out = Array4::<f32>::zeros((self.len(), c, h, w));
        for (t, mut row) in self.transformations.iter().zip(out.axis_iter_mut(Axis(0))) {
            row.assign(&t.apply(image));
        }
        out
    }
}

impl<'a> IntoIterator for &'a TransformationSet {
    type Item = &'a AffineTransformation;
    type IntoIter = core::slice::Iter<'a, AffineTransformation>;

    fn into_iter(self) -> Self::IntoIter {
        self.transformations.iter()
    }
}

impl fmt::Display for TransformationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
