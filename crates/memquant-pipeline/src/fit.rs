//! Joint gradient-descent fit of a profile batch.
//!
//! Every step simulates all images, scores each with its masked mean
//! squared error, averages the scores over the batch and takes one Adam
//! step on the active parameter groups. Images are independent given
//! the shared sigma, so simulation and back-propagation run per image
//! (in parallel with the `rayon` feature) and are reduced afterwards.

use log::trace;
use ndarray::{Array2, Array3, Axis};

use crate::model::{CurveModel, CurveParams};
use crate::observer::{StepObserver, StepRecord};
use crate::optimizer::{Adam, ParamKind, Params};
use crate::parallel::map_images;
use crate::sampler::ProfileBatch;
use crate::spline::OffsetSpline;
use crate::types::{NumericQuantity, QuantConfig, QuantError};

/// Smallest kernel width an adaptive fit may reach.
pub const MIN_SIGMA: f64 = 0.1;

/// Fixed settings for one fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FitSettings {
    /// Curve family.
    pub model: CurveModel,
    /// Offset bound: offsets are `freedom * tanh(spline)`.
    pub freedom: f64,
    /// Whether boundaries are closed (affects the offset spline).
    pub periodic: bool,
    /// Descent steps.
    pub steps: usize,
    /// Adam learning rate.
    pub learning_rate: f64,
    /// Parameter groups to optimize.
    pub active: Vec<ParamKind>,
    /// Outer iteration this fit belongs to, for observers.
    pub iteration: usize,
}

impl FitSettings {
    /// Settings for `config`.
    #[must_use]
    pub fn from_config(config: &QuantConfig) -> Self {
        Self {
            model: CurveModel::from_fit_outer(config.fit_outer),
            freedom: config.freedom,
            periodic: config.periodic,
            steps: config.descent_steps,
            learning_rate: config.learning_rate,
            active: ParamKind::active(config),
            iteration: 0,
        }
    }

    fn wants(&self, kind: ParamKind) -> bool {
        self.active.contains(&kind)
    }
}

/// Result of a fit, on the normalized intensity scale.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOutcome {
    /// Final parameters.
    pub params: Params,
    /// Final offsets `(images, width)`, zero in padding.
    pub offsets: Array2<f64>,
    /// Final simulated profiles `(images, thickness, width)`.
    pub sims: Array3<f64>,
    /// Per-image loss at every step `(images, steps)`.
    pub losses: Array2<f64>,
}

impl FitOutcome {
    /// Batch-mean loss at `step`, or NaN past the last step.
    #[must_use]
    pub fn mean_loss(&self, step: usize) -> f64 {
        if step >= self.losses.ncols() {
            return f64::NAN;
        }
        self.losses.column(step).mean().unwrap_or(f64::NAN)
    }
}

/// What one image contributes to a step.
struct ImageStep {
    loss: f64,
    sim: Array2<f64>,
    grads: Option<ImageGrads>,
}

struct ImageGrads {
    membrane: Vec<f64>,
    cytoplasm: Vec<f64>,
    outer: Vec<f64>,
    knots: Option<Vec<f64>>,
    sigma: f64,
}

impl ImageGrads {
    fn is_finite(&self) -> bool {
        self.membrane
            .iter()
            .chain(&self.cytoplasm)
            .chain(&self.outer)
            .chain(self.knots.iter().flatten())
            .all(|g| g.is_finite())
            && self.sigma.is_finite()
    }
}

/// Per-image dense offset evaluation.
struct Offsets<'a> {
    splines: &'a [OffsetSpline],
    freedom: f64,
    width: usize,
}

impl Offsets<'_> {
    /// Raw spline values and bounded offsets for image `i`, padded to
    /// the batch width.
    fn image(&self, params: &Params, i: usize) -> (Vec<f64>, Vec<f64>) {
        let mut raw = vec![0.0; self.width];
        if self.freedom > 0.0 {
            let knots = params.knots.row(i).to_vec();
            self.splines[i].evaluate_into(&knots, &mut raw);
        }
        let bounded = raw.iter().map(|r| self.freedom * r.tanh()).collect();
        (raw, bounded)
    }
}

/// Minimize the batch's masked mean squared error from `initial`.
///
/// # Errors
///
/// Returns [`QuantError::Numerical`] for the first image whose loss or
/// gradient becomes non-finite.
pub fn fit(
    batch: &ProfileBatch,
    initial: Params,
    settings: &FitSettings,
    observer: &mut dyn StepObserver,
) -> Result<FitOutcome, QuantError> {
    let n = batch.len();
    let width = batch.width();
    let thickness = batch.thickness();
    let knots = initial.knots.ncols();
    let splines: Vec<OffsetSpline> = batch
        .lengths()
        .iter()
        .map(|&len| OffsetSpline::new(knots, len, settings.periodic))
        .collect();
    let offsets = Offsets {
        splines: &splines,
        freedom: settings.freedom,
        width,
    };
    let pad = batch.mask();

    let mut params = initial;
    let mut adam = Adam::new(settings.learning_rate, &settings.active, &params);
    let mut losses = Array2::zeros((n, settings.steps));
    let wants_sims = observer.wants_sims();

    for step in 0..settings.steps {
        let results = map_images(n, |i| image_step(batch, &pad, &params, &offsets, settings, i, true));

        for (i, r) in results.iter().enumerate() {
            if !r.loss.is_finite() {
                return Err(QuantError::Numerical {
                    step,
                    image: i,
                    quantity: NumericQuantity::Loss,
                });
            }
            if r.grads.as_ref().is_some_and(|g| !g.is_finite()) {
                return Err(QuantError::Numerical {
                    step,
                    image: i,
                    quantity: NumericQuantity::Gradient,
                });
            }
        }

        let step_losses: Vec<f64> = results.iter().map(|r| r.loss).collect();
        losses.column_mut(step).assign(&ndarray::ArrayView1::from(&step_losses));
        #[allow(clippy::cast_precision_loss)]
        let mean = step_losses.iter().sum::<f64>() / n.max(1) as f64;
        trace!("step {step}: batch loss {mean:.6e}, sigma {:.4}", params.sigma);

        let sims = wants_sims.then(|| stack(results.iter().map(|r| &r.sim), n, thickness, width));
        observer.on_step(&StepRecord {
            iteration: settings.iteration,
            step,
            losses: &step_losses,
            params: &params,
            norms: batch.norms(),
            sims: sims.as_ref().map(Array3::view),
        });

        let grads = reduce(&params, results);
        adam.step(&mut params, &grads);
        params.sigma = params.sigma.max(MIN_SIGMA);
    }

    let finals = map_images(n, |i| image_step(batch, &pad, &params, &offsets, settings, i, false));
    let sims = stack(finals.iter().map(|r| &r.sim), n, thickness, width);
    let mut dense = Array2::zeros((n, width));
    for (i, mut row) in dense.axis_iter_mut(Axis(0)).enumerate() {
        let (_, bounded) = offsets.image(&params, i);
        for (j, (o, b)) in row.iter_mut().zip(bounded).enumerate() {
            *o = if j < batch.lengths()[i] { b } else { 0.0 };
        }
    }

    Ok(FitOutcome {
        params,
        offsets: dense,
        sims,
        losses,
    })
}

/// Simulate image `i`, score it and (optionally) back-propagate.
fn image_step(
    batch: &ProfileBatch,
    pad: &Array2<f64>,
    params: &Params,
    offsets: &Offsets<'_>,
    settings: &FitSettings,
    i: usize,
    with_grads: bool,
) -> ImageStep {
    let (raw, bounded) = offsets.image(params, i);
    let membrane = params.membrane.row(i).to_vec();
    let cytoplasm = params.cytoplasm.row(i).to_vec();
    let outer = params.outer.row(i).to_vec();
    let curve = CurveParams {
        membrane: &membrane,
        cytoplasm: &cytoplasm,
        outer: Some(&outer),
        offsets: &bounded,
    };
    let (sim, model_mask) = settings.model.simulate(&curve, params.sigma, batch.thickness());

    let target = batch.target(i);
    let pad_row = pad.row(i);
    let weights = Array2::from_shape_fn(sim.dim(), |(r, j)| model_mask[[r, j]] * pad_row[j]);
    let total: f64 = weights.sum();
    let diff = &sim - &target;
    let loss = if total > 0.0 {
        (&diff * &diff * &weights).sum() / total
    } else {
        0.0
    };

    let grads = with_grads.then(|| {
        #[allow(clippy::cast_precision_loss)]
        let scale = if total > 0.0 {
            2.0 / (batch.len() as f64 * total)
        } else {
            0.0
        };
        let dsim = &diff * &weights * scale;
        let want_offsets = settings.wants(ParamKind::Offsets);
        let g = settings.model.backward(
            &curve,
            params.sigma,
            dsim.view(),
            want_offsets,
            settings.wants(ParamKind::Sigma),
        );
        let knots = g.offsets.map(|d_off| {
            let d_raw: Vec<f64> = d_off
                .iter()
                .zip(&raw)
                .map(|(d, r)| {
                    let t = r.tanh();
                    d * settings.freedom * t.mul_add(-t, 1.0)
                })
                .collect();
            offsets.splines[i].backprop(&d_raw)
        });
        ImageGrads {
            membrane: g.membrane,
            cytoplasm: g.cytoplasm,
            outer: g.outer,
            knots,
            sigma: g.sigma.unwrap_or(0.0),
        }
    });

    ImageStep { loss, sim, grads }
}

/// Gather per-image gradients into one [`Params`]-shaped gradient.
fn reduce(params: &Params, results: Vec<ImageStep>) -> Params {
    let mut grads = params.zeros_like();
    for (i, r) in results.into_iter().enumerate() {
        let Some(g) = r.grads else { continue };
        copy_row(&mut grads.membrane, i, &g.membrane);
        copy_row(&mut grads.cytoplasm, i, &g.cytoplasm);
        copy_row(&mut grads.outer, i, &g.outer);
        if let Some(k) = g.knots {
            copy_row(&mut grads.knots, i, &k);
        }
        grads.sigma += g.sigma;
    }
    grads
}

fn copy_row(dst: &mut Array2<f64>, i: usize, src: &[f64]) {
    for (d, s) in dst.row_mut(i).iter_mut().zip(src) {
        *d = *s;
    }
}

fn stack<'a>(
    sims: impl Iterator<Item = &'a Array2<f64>>,
    n: usize,
    thickness: usize,
    width: usize,
) -> Array3<f64> {
    let mut out = Array3::zeros((n, thickness, width));
    for (mut dst, src) in out.outer_iter_mut().zip(sims) {
        dst.assign(src);
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::cortex_profile;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Raw `thickness x len` profile with the cortex at row
    /// `thickness / 2 + shift`.
    fn synthetic(thickness: usize, len: usize, mem: f64, cyt: f64, sigma: f64, shift: f64) -> Array2<f64> {
        Array2::from_shape_fn((thickness, len), |(r, _)| {
            let z = r as f64 - thickness as f64 / 2.0 - shift;
            cortex_profile(z, mem, cyt, sigma)
        })
    }

    fn settings(config: &QuantConfig) -> FitSettings {
        FitSettings::from_config(config)
    }

    fn run(batch: &ProfileBatch, config: &QuantConfig) -> FitOutcome {
        let initial = Params::neutral(batch.len(), batch.width(), config.roi_knots, config.sigma);
        fit(batch, initial, &settings(config), &mut ()).unwrap()
    }

    #[test]
    fn recovers_amplitudes_with_zero_offset() {
        for periodic in [true, false] {
            let config = QuantConfig {
                periodic,
                thickness: 20,
                roi_knots: 8,
                descent_steps: 800,
                learning_rate: 0.02,
                ..QuantConfig::default()
            };
            let profile = synthetic(20, 30, 100.0, 30.0, 2.0, 0.0);
            let batch = ProfileBatch::from_profiles(&[profile], false).unwrap();
            let out = run(&batch, &config);
            let norm = batch.norms()[0];
            for j in 0..30 {
                let mem = out.params.membrane[[0, j]] * norm;
                let cyt = out.params.cytoplasm[[0, j]] * norm;
                assert!((mem - 100.0).abs() < 5.0, "periodic={periodic} mem {mem}");
                assert!((cyt - 30.0).abs() < 2.0, "periodic={periodic} cyt {cyt}");
                assert!(out.offsets[[0, j]].abs() < 0.3, "offset {}", out.offsets[[0, j]]);
            }
            assert!(out.mean_loss(config.descent_steps - 1) < out.mean_loss(0));
        }
    }

    #[test]
    fn recovers_shifted_membrane() {
        let config = QuantConfig {
            thickness: 20,
            roi_knots: 6,
            descent_steps: 1000,
            learning_rate: 0.02,
            ..QuantConfig::default()
        };
        // Cortex two rows further in, so the fitted offset is -2.
        let profile = synthetic(20, 24, 1.0, 0.3, 2.0, 2.0);
        let batch = ProfileBatch::from_profiles(&[profile], false).unwrap();
        let out = run(&batch, &config);
        let mean_offset = out.offsets.row(0).mean().unwrap();
        assert!((mean_offset + 2.0).abs() < 0.3, "mean offset {mean_offset}");
    }

    #[test]
    fn final_loss_improves_for_most_seeds() {
        let config = QuantConfig {
            thickness: 20,
            roi_knots: 5,
            descent_steps: 150,
            ..QuantConfig::default()
        };
        let mut improved = 0;
        let trials = 40;
        for seed in 0..trials {
            let mut rng = StdRng::seed_from_u64(seed);
            let mem = rng.gen_range(0.5..2.0);
            let cyt = rng.gen_range(0.1..0.6);
            let shift = rng.gen_range(-2.0..2.0);
            let mut profile = synthetic(20, 16, mem, cyt, 2.0, shift);
            profile.mapv_inplace(|v| v + rng.gen_range(-0.05..0.05));
            let batch = ProfileBatch::from_profiles(&[profile], false).unwrap();
            let out = run(&batch, &config);
            if out.losses[[0, config.descent_steps - 1]] <= out.losses[[0, 0]] {
                improved += 1;
            }
        }
        assert!(improved * 100 >= trials * 95, "{improved}/{trials} improved");
    }

    #[test]
    fn recovers_outer_baseline() {
        let config = QuantConfig {
            thickness: 20,
            roi_knots: 6,
            fit_outer: true,
            descent_steps: 1000,
            learning_rate: 0.02,
            ..QuantConfig::default()
        };
        let s = settings(&config);
        assert_eq!(s.model, CurveModel::OuterBaseline);
        assert!(s.active.contains(&ParamKind::Outer));

        // Same cortex as `synthetic`, stepping up from an outer level of 0.1.
        let profile = Array2::from_shape_fn((20, 16), |(r, _)| {
            let z = r as f64 - 10.0;
            let step = 0.5 * (1.0 + libm::erf(z / 2.0));
            cortex_profile(z, 1.0, 0.3, 2.0) + 0.1 * (1.0 - step)
        });
        let batch = ProfileBatch::from_profiles(&[profile], false).unwrap();
        let out = run(&batch, &config);

        let results = crate::results::assemble(&batch, &out, &[16], false, true);
        let image = &results[0];
        let outer = image.outer.as_ref().unwrap();
        assert_eq!(image.outer_full.as_ref().unwrap().len(), 16);
        for j in 0..16 {
            assert!((outer[j] - 0.1).abs() < 0.02, "outer {}", outer[j]);
            assert!((image.membrane[j] - 1.0).abs() < 0.05, "mem {}", image.membrane[j]);
            assert!((image.cytoplasm[j] - 0.3).abs() < 0.02, "cyt {}", image.cytoplasm[j]);
        }
    }

    #[test]
    fn mean_loss_past_last_step_is_nan() {
        let config = QuantConfig {
            thickness: 8,
            roi_knots: 3,
            descent_steps: 4,
            ..QuantConfig::default()
        };
        let batch = ProfileBatch::from_profiles(&[synthetic(8, 5, 1.0, 0.3, 2.0, 0.0)], false).unwrap();
        let out = run(&batch, &config);
        assert!(out.mean_loss(3).is_finite());
        assert!(out.mean_loss(4).is_nan());
        assert!(out.mean_loss(usize::MAX).is_nan());
    }

    #[test]
    fn zero_freedom_freezes_offsets() {
        let config = QuantConfig {
            thickness: 16,
            freedom: 0.0,
            roi_knots: 4,
            descent_steps: 50,
            ..QuantConfig::default()
        };
        let s = settings(&config);
        assert!(!s.active.contains(&ParamKind::Offsets));

        let batch = ProfileBatch::from_profiles(&[synthetic(16, 10, 1.0, 0.3, 2.0, 1.5)], false).unwrap();
        let initial = Params::neutral(1, 10, 4, 2.0);
        // Gradients on the knots are never produced.
        let pad = batch.mask();
        let splines = vec![OffsetSpline::new(4, 10, true)];
        let offsets = Offsets {
            splines: &splines,
            freedom: 0.0,
            width: 10,
        };
        let step = image_step(&batch, &pad, &initial, &offsets, &s, 0, true);
        assert!(step.grads.unwrap().knots.is_none());

        let out = run(&batch, &config);
        assert!(out.params.knots.iter().all(|&k| k == 0.0));
        assert!(out.offsets.iter().all(|&o| o == 0.0));
    }

    #[test]
    fn offsets_stay_within_freedom() {
        let config = QuantConfig {
            thickness: 30,
            freedom: 1.5,
            roi_knots: 4,
            descent_steps: 300,
            learning_rate: 0.05,
            ..QuantConfig::default()
        };
        // True shift exceeds the allowed freedom.
        let batch = ProfileBatch::from_profiles(&[synthetic(30, 12, 1.0, 0.3, 2.0, 6.0)], false).unwrap();
        let out = run(&batch, &config);
        assert!(out.offsets.iter().all(|&o| o.abs() <= 1.5));
    }

    #[test]
    fn padded_columns_do_not_affect_loss() {
        let config = QuantConfig {
            thickness: 16,
            roi_knots: 4,
            descent_steps: 20,
            nfits: None,
            ..QuantConfig::default()
        };
        let short = synthetic(16, 8, 1.0, 0.3, 2.0, 0.0);
        let long = synthetic(16, 12, 1.0, 0.3, 2.0, 0.0);
        let batch = ProfileBatch::from_profiles(&[short.clone(), long], false).unwrap();
        let alone = ProfileBatch::from_profiles(&[short], false).unwrap();
        let both = run(&batch, &config);
        let single = run(&alone, &config);
        // Same per-image objective up to the batch-size gradient scale,
        // so the first-step loss matches exactly.
        assert!((both.losses[[0, 0]] - single.losses[[0, 0]]).abs() < 1e-12);
        assert!(both.offsets.row(0).iter().skip(8).all(|&o| o == 0.0));
    }

    #[test]
    fn adaptive_sigma_moves_towards_truth() {
        let config = QuantConfig {
            thickness: 30,
            roi_knots: 4,
            freedom: 0.0,
            adaptive_sigma: true,
            descent_steps: 600,
            learning_rate: 0.02,
            ..QuantConfig::default()
        };
        let batch = ProfileBatch::from_profiles(&[synthetic(30, 10, 1.0, 0.3, 3.0, 0.0)], false).unwrap();
        let out = run(&batch, &config);
        assert!((out.params.sigma - 3.0).abs() < 0.5, "sigma {}", out.params.sigma);
    }

    #[test]
    fn non_finite_target_is_reported() {
        let config = QuantConfig {
            thickness: 8,
            roi_knots: 4,
            descent_steps: 5,
            ..QuantConfig::default()
        };
        let mut profile = synthetic(8, 6, 1.0, 0.3, 2.0, 0.0);
        profile[[3, 2]] = f64::NAN;
        let batch = ProfileBatch::from_profiles(&[synthetic(8, 6, 1.0, 0.3, 2.0, 0.0), profile], false).unwrap();
        let initial = Params::neutral(2, 6, 4, 2.0);
        let err = fit(&batch, initial, &settings(&config), &mut ()).unwrap_err();
        assert_eq!(
            err,
            QuantError::Numerical {
                step: 0,
                image: 1,
                quantity: NumericQuantity::Loss
            }
        );
    }

    #[test]
    fn observer_sees_every_step() {
        struct Steps(Vec<usize>, bool);
        impl StepObserver for Steps {
            fn wants_sims(&self) -> bool {
                true
            }
            fn on_step(&mut self, record: &StepRecord<'_>) {
                self.0.push(record.step);
                self.1 &= record.sims.is_some_and(|s| s.dim() == (1, 8, 5));
            }
        }
        let config = QuantConfig {
            thickness: 8,
            roi_knots: 3,
            descent_steps: 7,
            ..QuantConfig::default()
        };
        let batch = ProfileBatch::from_profiles(&[synthetic(8, 5, 1.0, 0.3, 2.0, 0.0)], false).unwrap();
        let mut observer = Steps(Vec::new(), true);
        fit(&batch, Params::neutral(1, 5, 3, 2.0), &settings(&config), &mut observer).unwrap();
        assert_eq!(observer.0, (0..7).collect::<Vec<_>>());
        assert!(observer.1);
    }
}
