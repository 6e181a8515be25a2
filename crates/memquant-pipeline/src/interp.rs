//! Interpolation utilities: 1-D splines, resampling, bicubic image
//! sampling and percentiles.
//!
//! All 1-D helpers treat their input as samples at the integer
//! positions `0..n`. Resampling to `m` points evaluates at `m` evenly
//! spaced positions spanning `[0, n - 1]`, so both endpoints are kept.

use ndarray::{Array2, ArrayView2, Axis};

/// Interpolation method for 1-D resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Piecewise linear.
    Linear,
    /// Natural cubic spline.
    Cubic,
}

/// Natural cubic spline through uniformly spaced samples.
///
/// Second derivatives are zero at both ends. Evaluation outside
/// `[0, n - 1]` extrapolates the end segments.
#[derive(Debug, Clone)]
pub struct CubicSpline {
    y: Vec<f64>,
    /// Second derivatives at each sample.
    m: Vec<f64>,
}

impl CubicSpline {
    /// Fit a spline through `values` sampled at `0, 1, ..., n - 1`.
    #[must_use]
    pub fn new(values: &[f64]) -> Self {
        let n = values.len();
        let mut m = vec![0.0; n];
        if n >= 3 {
            // Tridiagonal system for the interior second derivatives:
            // m[i-1] + 4 m[i] + m[i+1] = 6 (y[i+1] - 2 y[i] + y[i-1]).
            let interior = n - 2;
            let mut diag = vec![4.0; interior];
            let mut rhs: Vec<f64> = (1..n - 1)
                .map(|i| 6.0 * (values[i + 1] - 2.0 * values[i] + values[i - 1]))
                .collect();

            // Thomas algorithm; sub- and super-diagonals are all ones.
            for i in 1..interior {
                let w = 1.0 / diag[i - 1];
                diag[i] -= w;
                rhs[i] -= w * rhs[i - 1];
            }
            m[interior] = rhs[interior - 1] / diag[interior - 1];
            for i in (0..interior - 1).rev() {
                m[i + 1] = (rhs[i] - m[i + 2]) / diag[i];
            }
        }
        Self {
            y: values.to_vec(),
            m,
        }
    }

    /// Evaluate the spline at position `t`.
    #[must_use]
    pub fn eval(&self, t: f64) -> f64 {
        let n = self.y.len();
        match n {
            0 => 0.0,
            1 => self.y[0],
            _ => {
                let i = segment_index(t, n);
                #[allow(clippy::cast_precision_loss)]
                let u = t - i as f64;
                let v = 1.0 - u;
                let linear = v.mul_add(self.y[i], u * self.y[i + 1]);
                let curvature =
                    (v * v * v - v).mul_add(self.m[i], (u * u * u - u) * self.m[i + 1]) / 6.0;
                linear + curvature
            }
        }
    }
}

/// Index of the segment `[i, i + 1]` containing `t`, clamped so both
/// ends exist.
fn segment_index(t: f64, n: usize) -> usize {
    if t <= 0.0 || t.is_nan() {
        return 0;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let i = t.floor() as usize;
    i.min(n - 2)
}

/// Piecewise-linear interpolation of samples at integer positions.
#[must_use]
pub fn linear_at(values: &[f64], t: f64) -> f64 {
    match values.len() {
        0 => 0.0,
        1 => values[0],
        n => {
            let i = segment_index(t, n);
            #[allow(clippy::cast_precision_loss)]
            let u = t - i as f64;
            (values[i + 1] - values[i]).mul_add(u, values[i])
        }
    }
}

/// `num` evenly spaced values from `start` to `stop` inclusive.
///
/// A single value yields `start`.
pub fn linspace(start: f64, stop: f64, num: usize) -> impl Iterator<Item = f64> {
    #[allow(clippy::cast_precision_loss)]
    let step = if num > 1 {
        (stop - start) / (num - 1) as f64
    } else {
        0.0
    };
    #[allow(clippy::cast_precision_loss)]
    (0..num).map(move |i| step.mul_add(i as f64, start))
}

/// Resample `values` onto `len` evenly spaced positions spanning the
/// original range.
#[must_use]
pub fn resample(values: &[f64], len: usize, method: Method) -> Vec<f64> {
    #[allow(clippy::cast_precision_loss)]
    let last = values.len().saturating_sub(1) as f64;
    let positions = linspace(0.0, last, len);
    match method {
        Method::Linear => positions.map(|t| linear_at(values, t)).collect(),
        Method::Cubic => {
            let spline = CubicSpline::new(values);
            positions.map(|t| spline.eval(t)).collect()
        }
    }
}

/// Resample every row of `profile` to `len` columns.
#[must_use]
pub fn resample_columns(profile: ArrayView2<'_, f64>, len: usize, method: Method) -> Array2<f64> {
    let mut out = Array2::zeros((profile.nrows(), len));
    for (src, mut dst) in profile.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
        let row = src.to_vec();
        for (d, v) in dst.iter_mut().zip(resample(&row, len, method)) {
            *d = v;
        }
    }
    out
}

/// Keys cubic convolution kernel with `a = -0.5` (Catmull-Rom).
fn keys_kernel(x: f64) -> f64 {
    const A: f64 = -0.5;
    let x = x.abs();
    if x <= 1.0 {
        ((A + 2.0) * x - (A + 3.0)) * x * x + 1.0
    } else if x < 2.0 {
        ((A * x - 5.0 * A) * x + 8.0 * A) * x - 4.0 * A
    } else {
        0.0
    }
}

/// Sample `image` (indexed `[y, x]`) at a sub-pixel location with
/// bicubic interpolation.
///
/// Neighbours outside the image are clamped to the nearest edge pixel.
#[must_use]
pub fn bicubic(image: ArrayView2<'_, f64>, x: f64, y: f64) -> f64 {
    let (h, w) = image.dim();
    if h == 0 || w == 0 {
        return 0.0;
    }
    let x0 = x.floor();
    let y0 = y.floor();

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let clamp = |v: f64, len: usize| -> usize { v.clamp(0.0, (len - 1) as f64) as usize };

    let mut acc = 0.0;
    for j in -1..=2 {
        let yy = y0 + f64::from(j);
        let wy = keys_kernel(y - yy);
        if wy == 0.0 {
            continue;
        }
        let row = clamp(yy, h);
        for i in -1..=2 {
            let xx = x0 + f64::from(i);
            let wx = keys_kernel(x - xx);
            acc += wx * wy * image[[row, clamp(xx, w)]];
        }
    }
    acc
}

/// Percentile `q` (0-100) with linear interpolation between order
/// statistics. Returns `None` for empty input.
#[must_use]
pub fn percentile(values: impl IntoIterator<Item = f64>, q: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.into_iter().collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    #[allow(clippy::cast_precision_loss)]
    let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    Some(linear_at(&sorted, rank))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ndarray::array;

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!((a - b).abs() <= tol, "expected {b}, got {a} (tol {tol})");
    }

    // --- CubicSpline ---

    #[test]
    fn spline_passes_through_samples() {
        let values = [0.0, 2.0, -1.0, 3.0, 0.5];
        let spline = CubicSpline::new(&values);
        for (i, &v) in values.iter().enumerate() {
            assert_close(spline.eval(i as f64), v, 1e-12);
        }
    }

    #[test]
    fn spline_reproduces_linear_data() {
        // Natural spline of linear data has zero curvature everywhere.
        let values: Vec<f64> = (0..6).map(|i| 2.0f64.mul_add(f64::from(i), 1.0)).collect();
        let spline = CubicSpline::new(&values);
        assert_close(spline.eval(2.25), 5.5, 1e-12);
        assert_close(spline.eval(4.9), 10.8, 1e-12);
    }

    #[test]
    fn spline_handles_short_inputs() {
        assert_close(CubicSpline::new(&[]).eval(1.0), 0.0, 0.0);
        assert_close(CubicSpline::new(&[4.0]).eval(3.0), 4.0, 0.0);
        assert_close(CubicSpline::new(&[0.0, 2.0]).eval(0.5), 1.0, 1e-12);
    }

    #[test]
    fn spline_is_smooth_between_samples() {
        // Alternating samples: the spline stays between them rather
        // than overshooting.
        let spline = CubicSpline::new(&[0.0, 1.0, 0.0, 1.0, 0.0]);
        let mid = spline.eval(1.5);
        assert!(mid < 1.0 && mid > 0.0, "got {mid}");
    }

    // --- resampling ---

    #[test]
    fn linspace_endpoints() {
        let v: Vec<f64> = linspace(0.0, 1.0, 5).collect();
        assert_eq!(v, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        let single: Vec<f64> = linspace(3.0, 9.0, 1).collect();
        assert_eq!(single, vec![3.0]);
    }

    #[test]
    fn resample_linear_keeps_endpoints() {
        let out = resample(&[0.0, 10.0, 20.0], 5, Method::Linear);
        assert_eq!(out.len(), 5);
        assert_close(out[0], 0.0, 1e-12);
        assert_close(out[1], 5.0, 1e-12);
        assert_close(out[4], 20.0, 1e-12);
    }

    #[test]
    fn resample_cubic_identity_length() {
        let values = [1.0, 3.0, 2.0, 5.0];
        let out = resample(&values, 4, Method::Cubic);
        for (a, b) in out.iter().zip(values) {
            assert_close(*a, b, 1e-12);
        }
    }

    #[test]
    fn resample_columns_shape() {
        let profile = array![[0.0, 1.0, 2.0], [4.0, 4.0, 4.0]];
        let out = resample_columns(profile.view(), 5, Method::Linear);
        assert_eq!(out.dim(), (2, 5));
        assert_close(out[[0, 1]], 0.5, 1e-12);
        assert_close(out[[1, 3]], 4.0, 1e-12);
    }

    // --- bicubic ---

    #[test]
    fn bicubic_exact_at_pixels() {
        let img = array![[0.0, 1.0, 2.0], [3.0, 4.0, 5.0], [6.0, 7.0, 8.0]];
        assert_close(bicubic(img.view(), 1.0, 1.0), 4.0, 1e-12);
        assert_close(bicubic(img.view(), 2.0, 0.0), 2.0, 1e-12);
    }

    #[test]
    fn bicubic_reproduces_linear_ramp() {
        let img = Array2::from_shape_fn((8, 8), |(y, x)| x as f64 + 2.0 * y as f64);
        assert_close(bicubic(img.view(), 3.5, 2.25), 3.5 + 4.5, 1e-9);
    }

    #[test]
    fn bicubic_clamps_outside() {
        let img = Array2::from_elem((4, 4), 7.0);
        assert_close(bicubic(img.view(), -3.0, 10.0), 7.0, 1e-12);
    }

    // --- percentile ---

    #[test]
    fn percentile_matches_linear_rule() {
        let values = (1..=5).map(f64::from);
        // rank = 0.99 * 4 = 3.96 -> 4 + 0.96 * (5 - 4)
        assert_close(percentile(values, 99.0).unwrap(), 4.96, 1e-12);
        assert_close(percentile([3.0, 1.0, 2.0], 50.0).unwrap(), 2.0, 1e-12);
        assert!(percentile(std::iter::empty(), 99.0).is_none());
    }
}
