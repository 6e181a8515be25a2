//! Run controller: repeated sample, fit and refine rounds.
//!
//! Each round samples fresh profiles from the current ROIs, fits them
//! from a neutral start and, unless it is the last round, moves the
//! ROIs by the fitted offsets. Only the last round's fit is returned.

use std::fmt;

use log::{debug, info};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::diagnostics::{IterationDiagnostics, RunDiagnostics, RunSummary, StageDiagnostics, StageMetrics};
use crate::fit::{FitOutcome, FitSettings, fit};
use crate::geometry;
use crate::observer::{StepObserver, Tee, TrainingHistory, TrainingRecorder};
use crate::optimizer::Params;
use crate::parallel::map_images;
use crate::refine::{displacement, refine};
use crate::results::{ImageResult, assemble};
use crate::sampler::{ProfileBatch, sample_batch};
use crate::types::{Frame, QuantConfig, QuantError, Roi};

/// Stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Sampling profiles from the current ROIs.
    Sampling,
    /// Fitting the sampled profiles.
    Optimizing,
    /// Moving the ROIs by the fitted offsets.
    Refining,
    /// Finished.
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sampling => "sampling",
            Self::Optimizing => "optimizing",
            Self::Refining => "refining",
            Self::Done => "done",
        })
    }
}

/// Everything a run produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantResult {
    /// Per-image results of the final fit.
    pub images: Vec<ImageResult>,
    /// ROIs the final fit was sampled along.
    pub rois: Vec<Roi>,
    /// Final ROIs moved by the final fit's offsets.
    pub refined_rois: Vec<Roi>,
    /// Kernel width used (or learned) by the final fit.
    pub sigma: f64,
    /// Per-image loss at every step of the final fit `(images, steps)`.
    pub losses: Array2<f64>,
    /// Timing and convergence diagnostics.
    pub diagnostics: RunDiagnostics,
    /// Per-step history of the final fit, with `save_training` or
    /// `save_sims`.
    pub training: Option<TrainingHistory>,
}

/// Validated inputs for a quantification run.
#[derive(Debug, Clone)]
pub struct Quantifier {
    frames: Vec<Frame>,
    rois: Vec<Roi>,
    config: QuantConfig,
}

impl Quantifier {
    /// Check inputs and build a runner.
    ///
    /// A single ROI is used for every frame.
    ///
    /// # Errors
    ///
    /// Returns [`QuantError::InvalidConfig`] for bad options or empty
    /// frames, [`QuantError::EmptyBatch`] without frames,
    /// [`QuantError::ShapeMismatch`] when the ROI count is neither 1
    /// nor the frame count, and [`QuantError::Geometry`] for malformed
    /// ROIs.
    pub fn new(frames: Vec<Frame>, rois: Vec<Roi>, config: QuantConfig) -> Result<Self, QuantError> {
        config.validate()?;
        if frames.is_empty() {
            return Err(QuantError::EmptyBatch);
        }
        if let Some(i) = frames.iter().position(|f| f.width() == 0 || f.height() == 0) {
            return Err(QuantError::InvalidConfig(format!("frame {i} is empty")));
        }
        let rois = match rois.len() {
            1 if frames.len() > 1 => vec![rois[0].clone(); frames.len()],
            n if n == frames.len() => rois,
            n => {
                return Err(QuantError::ShapeMismatch {
                    frames: frames.len(),
                    rois: n,
                });
            }
        };
        for (image, roi) in rois.iter().enumerate() {
            geometry::validate(roi).map_err(|source| QuantError::Geometry { image, source })?;
        }
        Ok(Self {
            frames,
            rois,
            config,
        })
    }

    /// The run configuration.
    #[must_use]
    pub const fn config(&self) -> &QuantConfig {
        &self.config
    }

    /// ROIs as supplied (after broadcasting).
    #[must_use]
    pub fn rois(&self) -> &[Roi] {
        &self.rois
    }

    /// Run every iteration and return the final fit.
    ///
    /// # Errors
    ///
    /// Any geometry or numerical failure aborts the whole batch.
    pub fn run(&self) -> Result<QuantResult, QuantError> {
        self.run_with_observer(&mut ())
    }

    /// Like [`run`](Self::run), reporting every descent step to
    /// `observer`.
    ///
    /// # Errors
    ///
    /// Any geometry or numerical failure aborts the whole batch.
    pub fn run_with_observer(&self, observer: &mut dyn StepObserver) -> Result<QuantResult, QuantError> {
        let config = &self.config;
        let run_start = web_time::Instant::now();
        let mut recorder = TrainingRecorder::new(config.save_training, config.save_sims);
        let mut observer = Tee(&mut recorder, observer);

        let mut rois = self.rois.clone();
        let mut sigma = config.sigma;
        let mut iteration = 0;
        let mut state = RunState::Sampling;
        let mut diagnostics = Vec::with_capacity(config.iterations);

        let mut batch: Option<(ProfileBatch, StageDiagnostics)> = None;
        let mut fitted: Option<(ProfileBatch, FitOutcome, Vec<ImageResult>)> = None;

        info!(
            "quantifying {} images over {} iterations",
            self.frames.len(),
            config.iterations
        );

        loop {
            debug!("iteration {iteration}: {state}");
            state = match state {
                RunState::Sampling => {
                    let start = web_time::Instant::now();
                    let sampled = sample_batch(&self.frames, &rois, config)?;
                    let stage = StageDiagnostics {
                        duration: start.elapsed(),
                        metrics: StageMetrics::Sampling {
                            images: sampled.len(),
                            thickness: sampled.thickness(),
                            width: sampled.width(),
                            min_norm: sampled.norms().iter().copied().fold(f64::INFINITY, f64::min),
                            max_norm: sampled.norms().iter().copied().fold(f64::NEG_INFINITY, f64::max),
                        },
                    };
                    batch = Some((sampled, stage));
                    RunState::Optimizing
                }
                RunState::Optimizing => {
                    let Some((sampled, sampling)) = batch.take() else {
                        return Err(QuantError::InvalidConfig("optimizing without profiles".into()));
                    };
                    let is_final = iteration + 1 == config.iterations;
                    observer.on_fit_start(iteration, is_final);

                    let start = web_time::Instant::now();
                    let settings = FitSettings {
                        iteration,
                        ..FitSettings::from_config(config)
                    };
                    let initial = Params::neutral(sampled.len(), sampled.width(), config.roi_knots, sigma);
                    let outcome = fit(&sampled, initial, &settings, &mut observer)?;
                    sigma = outcome.params.sigma;

                    let last = config.descent_steps - 1;
                    let optimizing = StageDiagnostics {
                        duration: start.elapsed(),
                        metrics: StageMetrics::Optimizing {
                            steps: config.descent_steps,
                            first_loss: outcome.mean_loss(0),
                            final_loss: outcome.mean_loss(last),
                            sigma,
                        },
                    };
                    debug!(
                        "iteration {iteration}: loss {:.6} -> {:.6}",
                        outcome.mean_loss(0),
                        outcome.mean_loss(last)
                    );
                    diagnostics.push(IterationDiagnostics {
                        iteration,
                        sampling,
                        optimizing,
                        refining: None,
                    });

                    let lengths: Vec<usize> = rois.iter().map(Roi::len).collect();
                    let images = assemble(
                        &sampled,
                        &outcome,
                        &lengths,
                        config.nfits.is_some(),
                        config.fit_outer,
                    );
                    fitted = Some((sampled, outcome, images));
                    if is_final {
                        RunState::Done
                    } else {
                        RunState::Refining
                    }
                }
                RunState::Refining => {
                    let start = web_time::Instant::now();
                    let images = fitted.as_ref().map(|f| f.2.as_slice()).unwrap_or_default();
                    let refined = self.refine_all(&rois, images)?;
                    let (mean, max) = mean_max_displacement(&rois, &refined);
                    if let Some(last) = diagnostics.last_mut() {
                        last.refining = Some(StageDiagnostics {
                            duration: start.elapsed(),
                            metrics: StageMetrics::Refining {
                                mean_displacement: mean,
                                max_displacement: max,
                            },
                        });
                    }
                    debug!("iteration {iteration}: boundaries moved {mean:.3}px on average");
                    rois = refined;
                    iteration += 1;
                    RunState::Sampling
                }
                RunState::Done => break,
            };
        }

        let Some((_, outcome, images)) = fitted else {
            return Err(QuantError::InvalidConfig("run finished without a fit".into()));
        };
        let refined_rois = self.refine_all(&rois, &images)?;
        let final_loss = outcome.mean_loss(config.descent_steps - 1);

        let diagnostics = RunDiagnostics {
            iterations: diagnostics,
            total_duration: run_start.elapsed(),
            summary: RunSummary {
                images: images.len(),
                iterations: config.iterations,
                descent_steps: config.descent_steps,
                final_loss,
                sigma,
            },
        };

        Ok(QuantResult {
            images,
            rois,
            refined_rois,
            sigma,
            losses: outcome.losses,
            diagnostics,
            training: recorder.into_history(),
        })
    }

    /// Move every ROI by its image's full-resolution offsets.
    fn refine_all(&self, rois: &[Roi], images: &[ImageResult]) -> Result<Vec<Roi>, QuantError> {
        let config = &self.config;
        map_images(rois.len(), |i| {
            let offsets = images.get(i).map_or(&[][..], |r| r.offsets_full.as_slice());
            refine(&rois[i], offsets, config.periodic, config.rotate)
                .map_err(|source| QuantError::Geometry { image: i, source })
        })
        .into_iter()
        .collect()
    }
}

fn mean_max_displacement(before: &[Roi], after: &[Roi]) -> (f64, f64) {
    let per_image: Vec<(f64, f64)> = before
        .iter()
        .zip(after)
        .map(|(a, b)| displacement(a, b))
        .collect();
    if per_image.is_empty() {
        return (0.0, 0.0);
    }
    #[allow(clippy::cast_precision_loss)]
    let mean = per_image.iter().map(|d| d.0).sum::<f64>() / per_image.len() as f64;
    let max = per_image.iter().map(|d| d.1).fold(0.0, f64::max);
    (mean, max)
}

/// Quantify `frames` along `rois` with `config`.
///
/// Shorthand for [`Quantifier::new`] followed by [`Quantifier::run`].
///
/// # Errors
///
/// See [`Quantifier::new`] and [`Quantifier::run`].
pub fn quantify(frames: Vec<Frame>, rois: Vec<Roi>, config: QuantConfig) -> Result<QuantResult, QuantError> {
    Quantifier::new(frames, rois, config)?.run()
}
