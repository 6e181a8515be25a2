//! Cross-section sampling and batch assembly.
//!
//! Each image is straightened along its ROI, smoothed along the
//! boundary, optionally resampled to a fixed number of columns and
//! normalized. Images whose column counts differ are right-padded with
//! zeros to the widest one; [`ProfileBatch::mask`] marks the real
//! columns.

use log::warn;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, s};

use crate::interp::{self, Method};
use crate::parallel::map_images;
use crate::straighten::{rolling_average, straighten};
use crate::types::{Frame, GeometryError, QuantConfig, QuantError, Roi};

/// Percentile used to normalize profile intensities.
pub const NORM_PERCENTILE: f64 = 99.0;

/// Normalized target profiles for a batch of images.
///
/// `targets` has shape `(images, thickness, width)`. Columns at or
/// beyond an image's length are zero padding.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileBatch {
    targets: Array3<f64>,
    lengths: Vec<usize>,
    norms: Vec<f64>,
}

impl ProfileBatch {
    /// Pad and normalize raw (unnormalized) profiles, each
    /// `thickness x length`.
    ///
    /// Every profile is divided by its own 99th-percentile intensity,
    /// or with `batch_norm` by the 99th percentile over all profiles.
    /// A zero or non-finite percentile falls back to 1.
    ///
    /// All profiles must share the same row count.
    ///
    /// # Errors
    ///
    /// Returns [`QuantError::EmptyBatch`] for no profiles and
    /// [`QuantError::InvalidConfig`] for mismatched row counts.
    pub fn from_profiles(profiles: &[Array2<f64>], batch_norm: bool) -> Result<Self, QuantError> {
        let Some(first) = profiles.first() else {
            return Err(QuantError::EmptyBatch);
        };
        let thickness = first.nrows();
        if let Some(i) = profiles.iter().position(|p| p.nrows() != thickness) {
            return Err(QuantError::InvalidConfig(format!(
                "profile {i} has {} rows, expected {thickness}",
                profiles[i].nrows()
            )));
        }

        let lengths: Vec<usize> = profiles.iter().map(Array2::ncols).collect();
        let width = lengths.iter().copied().max().unwrap_or(0);

        let norms: Vec<f64> = if batch_norm {
            let all = profiles.iter().flat_map(|p| p.iter().copied());
            let norm = checked_norm(interp::percentile(all, NORM_PERCENTILE), None);
            vec![norm; profiles.len()]
        } else {
            profiles
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    checked_norm(interp::percentile(p.iter().copied(), NORM_PERCENTILE), Some(i))
                })
                .collect()
        };

        let mut targets = Array3::zeros((profiles.len(), thickness, width));
        for ((mut dst, src), &norm) in targets.outer_iter_mut().zip(profiles).zip(&norms) {
            dst.slice_mut(s![.., ..src.ncols()])
                .assign(&src.mapv(|v| v / norm));
        }

        Ok(Self {
            targets,
            lengths,
            norms,
        })
    }

    /// Number of images.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    /// Whether the batch holds no images.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    /// Samples across the cortex (rows per profile).
    #[must_use]
    pub fn thickness(&self) -> usize {
        self.targets.dim().1
    }

    /// Padded column count.
    #[must_use]
    pub fn width(&self) -> usize {
        self.targets.dim().2
    }

    /// True column count of each image.
    #[must_use]
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Normalization factor each image was divided by.
    #[must_use]
    pub fn norms(&self) -> &[f64] {
        &self.norms
    }

    /// All padded targets, `(images, thickness, width)`.
    #[must_use]
    pub fn targets(&self) -> ArrayView3<'_, f64> {
        self.targets.view()
    }

    /// Padded target profile of image `i`.
    #[must_use]
    pub fn target(&self, i: usize) -> ArrayView2<'_, f64> {
        self.targets.index_axis(Axis(0), i)
    }

    /// Column validity mask, `(images, width)`: 1 for the first
    /// `lengths[i]` columns of row `i`, 0 elsewhere.
    #[must_use]
    pub fn mask(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.len(), self.width()), |(i, j)| {
            if j < self.lengths[i] { 1.0 } else { 0.0 }
        })
    }
}

fn checked_norm(value: Option<f64>, image: Option<usize>) -> f64 {
    match value {
        Some(v) if v.is_finite() && v != 0.0 => v,
        other => {
            match image {
                Some(i) => warn!("image {i}: normalization percentile is {other:?}, using 1"),
                None => warn!("batch normalization percentile is {other:?}, using 1"),
            }
            1.0
        }
    }
}

/// Straighten, smooth and (with `nfits`) resample one image.
///
/// Returns the unnormalized `thickness x columns` profile, where
/// `columns` is `nfits` if set and the ROI length otherwise.
///
/// # Errors
///
/// Propagates geometry errors from straightening.
pub fn sample(frame: &Frame, roi: &Roi, config: &QuantConfig) -> Result<Array2<f64>, GeometryError> {
    let straight = straighten(frame, roi, config.thickness, config.periodic)?;
    let smoothed = rolling_average(straight.view(), config.smoothing_window, config.periodic);
    Ok(match config.nfits {
        Some(nfits) => interp::resample_columns(smoothed.view(), nfits, Method::Cubic),
        None => smoothed,
    })
}

/// Sample every image against its ROI and assemble a normalized batch.
///
/// `frames` and `rois` must have equal length.
///
/// # Errors
///
/// Returns [`QuantError::Geometry`] tagged with the first failing
/// image, or [`QuantError::EmptyBatch`].
pub fn sample_batch(frames: &[Frame], rois: &[Roi], config: &QuantConfig) -> Result<ProfileBatch, QuantError> {
    if frames.len() != rois.len() {
        return Err(QuantError::ShapeMismatch {
            frames: frames.len(),
            rois: rois.len(),
        });
    }
    let profiles = map_images(frames.len(), |i| {
        sample(&frames[i], &rois[i], config).map_err(|source| QuantError::Geometry { image: i, source })
    })
    .into_iter()
    .collect::<Result<Vec<_>, _>>()?;
    ProfileBatch::from_profiles(&profiles, config.batch_norm)
}
