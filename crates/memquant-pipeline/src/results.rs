//! Per-image results at fit and boundary resolution.
//!
//! Fits run on normalized profiles; results here are rescaled back to
//! image intensities. With a fixed `nfits`, "full" arrays are
//! interpolated back to the ROI length (cubic for offsets, linear for
//! amplitudes and profiles). Otherwise they are cropped from the
//! padded batch.

use ndarray::{Array2, Axis, s};
use serde::{Deserialize, Serialize};

use crate::fit::FitOutcome;
use crate::interp::{self, Method};
use crate::sampler::ProfileBatch;

/// Fitted quantities for one image.
///
/// Amplitudes and profiles are on the image's intensity scale; offsets
/// are in pixels along the outward normal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageResult {
    /// Membrane amplitude at each fit position.
    pub membrane: Vec<f64>,
    /// Cytoplasm amplitude at each fit position.
    pub cytoplasm: Vec<f64>,
    /// Boundary offset at each fit position.
    pub offsets: Vec<f64>,
    /// Outer baseline at each fit position (only with `fit_outer`).
    pub outer: Option<Vec<f64>>,

    /// Membrane amplitude at each ROI point.
    pub membrane_full: Vec<f64>,
    /// Cytoplasm amplitude at each ROI point.
    pub cytoplasm_full: Vec<f64>,
    /// Boundary offset at each ROI point.
    pub offsets_full: Vec<f64>,
    /// Outer baseline at each ROI point (only with `fit_outer`).
    pub outer_full: Option<Vec<f64>>,

    /// Sampled profile, `thickness x roi_len`.
    pub target_full: Array2<f64>,
    /// Fitted profile, `thickness x roi_len`.
    pub sim_full: Array2<f64>,
    /// `target_full - sim_full`.
    pub resids_full: Array2<f64>,
}

/// Build per-image results from a finished fit.
///
/// `roi_lengths[i]` is the point count of the ROI image `i` was sampled
/// with. `resampled` is true when profiles were resampled to a fixed
/// column count.
#[must_use]
pub fn assemble(
    batch: &ProfileBatch,
    outcome: &FitOutcome,
    roi_lengths: &[usize],
    resampled: bool,
    fit_outer: bool,
) -> Vec<ImageResult> {
    (0..batch.len())
        .map(|i| {
            let len = batch.lengths()[i];
            let norm = batch.norms()[i];
            let row = |a: &Array2<f64>, scale: f64| -> Vec<f64> {
                a.row(i).slice(s![..len]).iter().map(|v| v * scale).collect()
            };
            let membrane = row(&outcome.params.membrane, norm);
            let cytoplasm = row(&outcome.params.cytoplasm, norm);
            let offsets = row(&outcome.offsets, 1.0);
            let outer = fit_outer.then(|| row(&outcome.params.outer, norm));

            let target = batch.target(i).slice(s![.., ..len]).mapv(|v| v * norm);
            let sim = outcome
                .sims
                .index_axis(Axis(0), i)
                .slice(s![.., ..len])
                .mapv(|v| v * norm);

            let full_len = roi_lengths[i];
            let (membrane_full, cytoplasm_full, offsets_full, outer_full, target_full, sim_full) =
                if resampled {
                    (
                        interp::resample(&membrane, full_len, Method::Linear),
                        interp::resample(&cytoplasm, full_len, Method::Linear),
                        interp::resample(&offsets, full_len, Method::Cubic),
                        outer
                            .as_ref()
                            .map(|o| interp::resample(o, full_len, Method::Linear)),
                        interp::resample_columns(target.view(), full_len, Method::Linear),
                        interp::resample_columns(sim.view(), full_len, Method::Linear),
                    )
                } else {
                    (
                        membrane.clone(),
                        cytoplasm.clone(),
                        offsets.clone(),
                        outer.clone(),
                        target,
                        sim,
                    )
                };
            let resids_full = &target_full - &sim_full;

            ImageResult {
                membrane,
                cytoplasm,
                offsets,
                outer,
                membrane_full,
                cytoplasm_full,
                offsets_full,
                outer_full,
                target_full,
                sim_full,
                resids_full,
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::optimizer::Params;
    use ndarray::Array3;

    fn outcome(batch: &ProfileBatch, fill: f64) -> FitOutcome {
        let n = batch.len();
        let w = batch.width();
        let mut params = Params::neutral(n, w, 4, 2.0);
        params.membrane.fill(fill);
        params.cytoplasm.fill(fill / 2.0);
        params.outer.fill(0.1);
        FitOutcome {
            params,
            offsets: Array2::from_elem((n, w), 0.5),
            sims: Array3::from_elem((n, batch.thickness(), w), 0.25),
            losses: Array2::zeros((n, 1)),
        }
    }

    #[test]
    fn cropped_results_match_roi_length() {
        let profiles = [Array2::from_elem((4, 6), 8.0), Array2::from_elem((4, 9), 8.0)];
        let batch = ProfileBatch::from_profiles(&profiles, false).unwrap();
        let results = assemble(&batch, &outcome(&batch, 1.0), &[6, 9], false, false);
        assert_eq!(results.len(), 2);
        let r = &results[0];
        assert_eq!(r.membrane.len(), 6);
        assert_eq!(r.offsets.len(), 6);
        assert_eq!(r.membrane_full.len(), 6);
        assert_eq!(r.target_full.dim(), (4, 6));
        assert!(r.outer.is_none());
        // Rescaled by the per-image norm (8).
        assert!((r.membrane[0] - 8.0).abs() < 1e-12);
        assert!((r.cytoplasm[0] - 4.0).abs() < 1e-12);
        assert!((r.offsets[0] - 0.5).abs() < 1e-12);
        assert!((r.target_full[[0, 0]] - 8.0).abs() < 1e-12);
        assert!((r.resids_full[[0, 0]] - 6.0).abs() < 1e-12);
    }

    #[test]
    fn resampled_results_interpolate_to_roi_length() {
        let batch = ProfileBatch::from_profiles(&[Array2::from_elem((3, 10), 2.0)], false).unwrap();
        let results = assemble(&batch, &outcome(&batch, 1.0), &[25], true, true);
        let r = &results[0];
        assert_eq!(r.membrane.len(), 10);
        assert_eq!(r.membrane_full.len(), 25);
        assert_eq!(r.cytoplasm_full.len(), 25);
        assert_eq!(r.offsets_full.len(), 25);
        assert_eq!(r.outer_full.as_ref().unwrap().len(), 25);
        assert_eq!(r.sim_full.dim(), (3, 25));
        assert!(r.offsets_full.iter().all(|&o| (o - 0.5).abs() < 1e-12));
        assert!((r.outer.as_ref().unwrap()[0] - 0.2).abs() < 1e-12);
    }
}
