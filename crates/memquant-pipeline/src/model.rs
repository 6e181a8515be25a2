//! Cross-section curve model and its analytic gradients.
//!
//! A profile column is the sum of a Gaussian membrane peak and an
//! error-function cytoplasm step, both centered on the middle row and
//! shifted by the column's offset:
//!
//! ```text
//! z   = clamp(row + offset, 0, T - 1.000001) - T / 2
//! g   = exp(-z^2 / (2 sigma^2))
//! c   = (1 + erf(z / sigma)) / 2
//! sim = mem * g + cyt * c                      (Plain)
//! sim = mem * g + (cyt - outer) * c + outer    (OuterBaseline)
//! ```

use std::f64::consts::PI;

use ndarray::{Array2, ArrayView2};

/// Lower bound subtracted from the last row when clamping positions.
const CLAMP_MARGIN: f64 = 1.000_001;

/// Which curve family profiles are fitted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveModel {
    /// Membrane peak plus cytoplasm step on a zero background.
    Plain,
    /// Membrane peak plus a step from an outer baseline to the
    /// cytoplasm level.
    OuterBaseline,
}

impl CurveModel {
    /// Pick the model for the `fit_outer` option.
    #[must_use]
    pub const fn from_fit_outer(fit_outer: bool) -> Self {
        if fit_outer {
            Self::OuterBaseline
        } else {
            Self::Plain
        }
    }
}

/// Per-column parameters of one image.
///
/// All slices have the same length (the number of profile columns).
#[derive(Debug, Clone, Copy)]
pub struct CurveParams<'a> {
    /// Membrane amplitude.
    pub membrane: &'a [f64],
    /// Cytoplasm amplitude.
    pub cytoplasm: &'a [f64],
    /// Outer baseline amplitude; ignored by [`CurveModel::Plain`] and
    /// treated as zero when absent.
    pub outer: Option<&'a [f64]>,
    /// Offset of the profile center, in rows.
    pub offsets: &'a [f64],
}

impl CurveParams<'_> {
    fn columns(&self) -> usize {
        self.membrane.len()
    }

    fn outer_at(&self, j: usize) -> f64 {
        self.outer.and_then(|o| o.get(j).copied()).unwrap_or(0.0)
    }
}

/// Gradients of a scalar loss with respect to [`CurveParams`] and sigma.
#[derive(Debug, Clone, PartialEq)]
pub struct CurveGradients {
    /// Per-column membrane gradient.
    pub membrane: Vec<f64>,
    /// Per-column cytoplasm gradient.
    pub cytoplasm: Vec<f64>,
    /// Per-column outer baseline gradient (zeros for the plain model).
    pub outer: Vec<f64>,
    /// Per-column offset gradient, if requested.
    pub offsets: Option<Vec<f64>>,
    /// Sigma gradient, if requested.
    pub sigma: Option<f64>,
}

/// Kernel values at one sample.
struct Kernel {
    g: f64,
    c: f64,
    /// `exp(-z^2 / sigma^2) / sqrt(pi)`, shared by the erf derivatives.
    e: f64,
    z: f64,
    clamped: bool,
}

fn kernel(row: usize, offset: f64, sigma: f64, thickness: usize) -> Kernel {
    #[allow(clippy::cast_precision_loss)]
    let t = thickness as f64;
    #[allow(clippy::cast_precision_loss)]
    let raw = row as f64 + offset;
    let pos = raw.clamp(0.0, t - CLAMP_MARGIN);
    let z = pos - t / 2.0;
    let s = z / sigma;
    Kernel {
        g: (-0.5 * s * s).exp(),
        c: 0.5 * (1.0 + libm::erf(s)),
        e: (-s * s).exp() / PI.sqrt(),
        z,
        clamped: !(0.0..=t - CLAMP_MARGIN).contains(&raw),
    }
}

impl CurveModel {
    /// Simulate a `thickness x columns` profile.
    ///
    /// Returns the profile and its validity mask. The mask flags
    /// samples whose clamped position left `[0, thickness]`, which only
    /// happens for non-finite offsets.
    #[must_use]
    pub fn simulate(self, params: &CurveParams<'_>, sigma: f64, thickness: usize) -> (Array2<f64>, Array2<f64>) {
        let cols = params.columns();
        let mut sim = Array2::zeros((thickness, cols));
        let mut mask = Array2::zeros((thickness, cols));
        #[allow(clippy::cast_precision_loss)]
        let t = thickness as f64;

        for j in 0..cols {
            let mem = params.membrane[j];
            let cyt = params.cytoplasm[j];
            let outer = params.outer_at(j);
            for r in 0..thickness {
                let k = kernel(r, params.offsets[j], sigma, thickness);
                sim[[r, j]] = match self {
                    Self::Plain => mem.mul_add(k.g, cyt * k.c),
                    Self::OuterBaseline => mem.mul_add(k.g, (cyt - outer).mul_add(k.c, outer)),
                };
                let pos = k.z + t / 2.0;
                mask[[r, j]] = if (0.0..=t).contains(&pos) { 1.0 } else { 0.0 };
            }
        }
        (sim, mask)
    }

    /// Back-propagate `dsim` (the loss gradient with respect to every
    /// simulated sample) onto the parameters.
    ///
    /// Offset and sigma gradients are only computed when requested.
    /// Clamped samples pass no gradient to their offset.
    #[must_use]
    pub fn backward(
        self,
        params: &CurveParams<'_>,
        sigma: f64,
        dsim: ArrayView2<'_, f64>,
        want_offsets: bool,
        want_sigma: bool,
    ) -> CurveGradients {
        let (thickness, cols) = dsim.dim();
        let cols = cols.min(params.columns());
        let mut membrane = vec![0.0; cols];
        let mut cytoplasm = vec![0.0; cols];
        let mut outer = vec![0.0; cols];
        let mut offsets = want_offsets.then(|| vec![0.0; cols]);
        let mut dsigma = 0.0;
        let s2 = sigma * sigma;

        for j in 0..cols {
            let mem = params.membrane[j];
            let step = match self {
                Self::Plain => params.cytoplasm[j],
                Self::OuterBaseline => params.cytoplasm[j] - params.outer_at(j),
            };
            for r in 0..thickness {
                let d = dsim[[r, j]];
                if d == 0.0 {
                    continue;
                }
                let k = kernel(r, params.offsets[j], sigma, thickness);
                membrane[j] += d * k.g;
                cytoplasm[j] += d * k.c;
                if self == Self::OuterBaseline {
                    outer[j] += d * (1.0 - k.c);
                }
                if let Some(off) = offsets.as_mut()
                    && !k.clamped
                {
                    let dpos = mem * k.g * (-k.z / s2) + step * k.e / sigma;
                    off[j] += d * dpos;
                }
                if want_sigma {
                    let dg = k.g * k.z * k.z / (s2 * sigma);
                    let dc = -(k.z / s2) * k.e;
                    dsigma += d * mem.mul_add(dg, step * dc);
                }
            }
        }

        CurveGradients {
            membrane,
            cytoplasm,
            outer,
            offsets,
            sigma: want_sigma.then_some(dsigma),
        }
    }
}

/// Simulate one image's profile with the given model.
#[must_use]
pub fn simulate(
    model: CurveModel,
    params: &CurveParams<'_>,
    sigma: f64,
    thickness: usize,
) -> (Array2<f64>, Array2<f64>) {
    model.simulate(params, sigma, thickness)
}
