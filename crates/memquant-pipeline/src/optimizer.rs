//! Trainable parameters and the Adam optimizer.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::types::QuantConfig;

/// Tag for one group of trainable parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamKind {
    /// Per-column membrane amplitudes.
    Membrane,
    /// Per-column cytoplasm amplitudes.
    Cytoplasm,
    /// Per-column outer baseline amplitudes.
    Outer,
    /// Raw offset spline knot values (before `freedom * tanh`).
    Offsets,
    /// Shared kernel width.
    Sigma,
}

impl ParamKind {
    /// The parameter groups a run optimizes, in a fixed order.
    ///
    /// Amplitudes are always active. Outer baselines need `fit_outer`,
    /// offsets need a nonzero `freedom` and sigma needs
    /// `adaptive_sigma`.
    #[must_use]
    pub fn active(config: &QuantConfig) -> Vec<Self> {
        let mut kinds = vec![Self::Membrane, Self::Cytoplasm];
        if config.fit_outer {
            kinds.push(Self::Outer);
        }
        if config.freedom > 0.0 {
            kinds.push(Self::Offsets);
        }
        if config.adaptive_sigma {
            kinds.push(Self::Sigma);
        }
        kinds
    }
}

/// Parameters for a batch, on the normalized intensity scale.
///
/// Amplitude arrays are `(images, width)`; `knots` is
/// `(images, roi_knots)`. Gradients use the same layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Params {
    /// Membrane amplitudes.
    pub membrane: Array2<f64>,
    /// Cytoplasm amplitudes.
    pub cytoplasm: Array2<f64>,
    /// Outer baseline amplitudes (zero unless fitted).
    pub outer: Array2<f64>,
    /// Raw offset knot values.
    pub knots: Array2<f64>,
    /// Kernel width.
    pub sigma: f64,
}

impl Params {
    /// Neutral starting point: every amplitude and knot zero.
    #[must_use]
    pub fn neutral(images: usize, width: usize, knots: usize, sigma: f64) -> Self {
        Self {
            membrane: Array2::zeros((images, width)),
            cytoplasm: Array2::zeros((images, width)),
            outer: Array2::zeros((images, width)),
            knots: Array2::zeros((images, knots)),
            sigma,
        }
    }

    /// Zeroed gradients shaped like `self`.
    #[must_use]
    pub fn zeros_like(&self) -> Self {
        Self {
            membrane: Array2::zeros(self.membrane.dim()),
            cytoplasm: Array2::zeros(self.cytoplasm.dim()),
            outer: Array2::zeros(self.outer.dim()),
            knots: Array2::zeros(self.knots.dim()),
            sigma: 0.0,
        }
    }

    /// The array behind an array-valued kind; `None` for sigma.
    #[must_use]
    pub const fn array(&self, kind: ParamKind) -> Option<&Array2<f64>> {
        match kind {
            ParamKind::Membrane => Some(&self.membrane),
            ParamKind::Cytoplasm => Some(&self.cytoplasm),
            ParamKind::Outer => Some(&self.outer),
            ParamKind::Offsets => Some(&self.knots),
            ParamKind::Sigma => None,
        }
    }

    /// Mutable access to the array behind an array-valued kind.
    pub const fn array_mut(&mut self, kind: ParamKind) -> Option<&mut Array2<f64>> {
        match kind {
            ParamKind::Membrane => Some(&mut self.membrane),
            ParamKind::Cytoplasm => Some(&mut self.cytoplasm),
            ParamKind::Outer => Some(&mut self.outer),
            ParamKind::Offsets => Some(&mut self.knots),
            ParamKind::Sigma => None,
        }
    }

    /// Number of scalar values in a group.
    #[must_use]
    pub fn count(&self, kind: ParamKind) -> usize {
        self.array(kind).map_or(1, Array2::len)
    }
}

/// Adam with the Keras defaults.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    steps: i32,
    slots: Vec<Slot>,
}

/// First and second moment estimates for one parameter group.
#[derive(Debug, Clone)]
struct Slot {
    kind: ParamKind,
    m: Vec<f64>,
    v: Vec<f64>,
}

impl Adam {
    /// Default exponential decay for the first moment.
    pub const DEFAULT_BETA1: f64 = 0.9;
    /// Default exponential decay for the second moment.
    pub const DEFAULT_BETA2: f64 = 0.999;
    /// Default denominator fuzz.
    pub const DEFAULT_EPSILON: f64 = 1e-7;

    /// Optimizer over `active` groups of `params`.
    #[must_use]
    pub fn new(learning_rate: f64, active: &[ParamKind], params: &Params) -> Self {
        let slots = active
            .iter()
            .map(|&kind| {
                let n = params.count(kind);
                Slot {
                    kind,
                    m: vec![0.0; n],
                    v: vec![0.0; n],
                }
            })
            .collect();
        Self {
            learning_rate,
            beta1: Self::DEFAULT_BETA1,
            beta2: Self::DEFAULT_BETA2,
            epsilon: Self::DEFAULT_EPSILON,
            steps: 0,
            slots,
        }
    }

    /// Parameter groups this optimizer updates.
    pub fn active(&self) -> impl Iterator<Item = ParamKind> + '_ {
        self.slots.iter().map(|s| s.kind)
    }

    /// Apply one update to every active group.
    pub fn step(&mut self, params: &mut Params, grads: &Params) {
        self.steps = self.steps.saturating_add(1);
        let lr = self.learning_rate * (1.0 - self.beta2.powi(self.steps)).sqrt()
            / (1.0 - self.beta1.powi(self.steps));
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);

        for slot in &mut self.slots {
            if slot.kind == ParamKind::Sigma {
                let value = std::iter::once(&mut params.sigma);
                update(value, std::iter::once(grads.sigma), slot, lr, b1, b2, eps);
            } else if let (Some(values), Some(g)) = (params.array_mut(slot.kind), grads.array(slot.kind)) {
                update(values.iter_mut(), g.iter().copied(), slot, lr, b1, b2, eps);
            }
        }
    }
}

fn update<'a>(
    values: impl Iterator<Item = &'a mut f64>,
    grads: impl Iterator<Item = f64>,
    slot: &mut Slot,
    lr: f64,
    b1: f64,
    b2: f64,
    eps: f64,
) {
    for (((x, g), m), v) in values.zip(grads).zip(&mut slot.m).zip(&mut slot.v) {
        *m = b1.mul_add(*m, (1.0 - b1) * g);
        *v = b2.mul_add(*v, (1.0 - b2) * g * g);
        *x -= lr * *m / (v.sqrt() + eps);
    }
}
