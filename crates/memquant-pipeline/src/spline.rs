//! Offset spline: a coarse set of knot values mapped to a dense
//! per-position offset curve.
//!
//! The curve is a uniform cubic B-spline over the knots padded with
//! ghost knots. Closed boundaries wrap (one ghost before, two after,
//! taken from the opposite end); open boundaries repeat their end
//! knots. The map from knot values to offsets is linear, so it is
//! stored as a sparse basis: each position depends on four knots.

/// Sparse B-spline basis from `knots` control values to `positions`
/// dense samples.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetSpline {
    knots: usize,
    basis: Vec<[(usize, f64); 4]>,
}

impl OffsetSpline {
    /// Build the basis for `knots` control values evaluated at
    /// `positions` evenly spaced samples.
    ///
    /// Closed curves sample `[0, knots)` without the endpoint, open
    /// curves sample `[0, knots - 1.000001]`.
    #[must_use]
    pub fn new(knots: usize, positions: usize, periodic: bool) -> Self {
        if knots == 0 {
            return Self {
                knots,
                basis: vec![[(0, 0.0); 4]; positions],
            };
        }
        #[allow(clippy::cast_precision_loss)]
        let n = knots as f64;
        #[allow(clippy::cast_precision_loss)]
        let ts: Vec<f64> = if periodic {
            (0..positions)
                .map(|k| n * k as f64 / positions as f64)
                .collect()
        } else {
            crate::interp::linspace(0.0, n - 1.000_001, positions)
                .map(|t| t.max(0.0))
                .collect()
        };

        // Ghost-padded control point `p` maps back to a real knot.
        let knot_index = |p: usize| -> usize {
            if periodic {
                (p + knots - 1) % knots
            } else {
                p.saturating_sub(1).min(knots - 1)
            }
        };

        let basis = ts
            .into_iter()
            .map(|t| {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let segment = t.floor() as usize;
                #[allow(clippy::cast_precision_loss)]
                let u = t - segment as f64;
                let w = bspline_weights(u);
                std::array::from_fn(|k| (knot_index(segment + k), w[k]))
            })
            .collect();

        Self { knots, basis }
    }

    /// Number of knots.
    #[must_use]
    pub const fn knots(&self) -> usize {
        self.knots
    }

    /// Number of dense positions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.basis.len()
    }

    /// Whether there are no dense positions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.basis.is_empty()
    }

    /// Dense curve for the given knot values, written into `out`.
    ///
    /// `out` positions beyond [`len`](Self::len) are left untouched.
    pub fn evaluate_into(&self, values: &[f64], out: &mut [f64]) {
        for (o, row) in out.iter_mut().zip(&self.basis) {
            *o = row.iter().map(|&(k, w)| w * values.get(k).copied().unwrap_or(0.0)).sum();
        }
    }

    /// Dense curve for the given knot values.
    #[must_use]
    pub fn evaluate(&self, values: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.len()];
        self.evaluate_into(values, &mut out);
        out
    }

    /// Pull a gradient on the dense curve back onto the knots
    /// (the transpose of [`evaluate`](Self::evaluate)).
    #[must_use]
    pub fn backprop(&self, dense_grad: &[f64]) -> Vec<f64> {
        let mut grad = vec![0.0; self.knots];
        for (g, row) in dense_grad.iter().zip(&self.basis) {
            for &(k, w) in row {
                grad[k] += w * g;
            }
        }
        grad
    }
}

/// Uniform cubic B-spline weights for local parameter `u` in `[0, 1)`.
fn bspline_weights(u: f64) -> [f64; 4] {
    let u2 = u * u;
    let u3 = u2 * u;
    let v = 1.0 - u;
    [
        v * v * v / 6.0,
        (3.0f64.mul_add(u3, -6.0 * u2) + 4.0) / 6.0,
        ((-3.0f64).mul_add(u3, 3.0 * u2) + 3.0f64.mul_add(u, 1.0)) / 6.0,
        u3 / 6.0,
    ]
}

/// Evaluate `knot_values` at `positions` dense samples.
#[must_use]
pub fn evaluate(knot_values: &[f64], positions: usize, periodic: bool) -> Vec<f64> {
    OffsetSpline::new(knot_values.len(), positions, periodic).evaluate(knot_values)
}
