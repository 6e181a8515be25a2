//! Per-step observation of the optimizer.
//!
//! The optimizer reports every descent step to a [`StepObserver`].
//! [`TrainingRecorder`] is the built-in observer behind the
//! `save_training` and `save_sims` options; it keeps only the final
//! iteration's fit.

use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::optimizer::Params;

/// One descent step as seen by an observer.
///
/// `losses` and `sims` are computed from `params`, before the step's
/// update is applied. All values are on the normalized intensity scale;
/// `norms` maps them back to image intensities.
#[derive(Debug, Clone, Copy)]
pub struct StepRecord<'a> {
    /// Zero-based outer iteration.
    pub iteration: usize,
    /// Zero-based descent step within the fit.
    pub step: usize,
    /// Per-image masked mean squared error.
    pub losses: &'a [f64],
    /// Parameters that produced `losses`.
    pub params: &'a Params,
    /// Per-image normalization factors of the batch.
    pub norms: &'a [f64],
    /// Simulated profiles `(images, thickness, width)`, present only
    /// when the observer asked for them.
    pub sims: Option<ArrayView3<'a, f64>>,
}

/// Receives optimizer progress.
pub trait StepObserver {
    /// Whether [`StepRecord::sims`] should be filled in.
    fn wants_sims(&self) -> bool {
        false
    }

    /// Called before each fit.
    fn on_fit_start(&mut self, _iteration: usize, _is_final: bool) {}

    /// Called once per descent step.
    fn on_step(&mut self, record: &StepRecord<'_>);
}

/// Observer that ignores every step.
impl StepObserver for () {
    fn on_step(&mut self, _record: &StepRecord<'_>) {}
}

/// Per-step history of the final fit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// Parameters at every step (empty unless `save_training`).
    pub params: Vec<Params>,
    /// Simulated profiles at every step on the image intensity scale
    /// (empty unless `save_sims`).
    pub sims: Vec<Array3<f64>>,
}

/// Records parameters and/or simulations for the final iteration.
#[derive(Debug, Clone, Default)]
pub struct TrainingRecorder {
    save_params: bool,
    save_sims: bool,
    recording: bool,
    history: TrainingHistory,
}

impl TrainingRecorder {
    /// Recorder for the requested quantities.
    #[must_use]
    pub fn new(save_params: bool, save_sims: bool) -> Self {
        Self {
            save_params,
            save_sims,
            ..Self::default()
        }
    }

    /// Whether anything is being recorded at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.save_params || self.save_sims
    }

    /// The recorded history, or `None` when recording was disabled.
    #[must_use]
    pub fn into_history(self) -> Option<TrainingHistory> {
        self.is_enabled().then_some(self.history)
    }
}

impl StepObserver for TrainingRecorder {
    fn wants_sims(&self) -> bool {
        self.save_sims
    }

    fn on_fit_start(&mut self, _iteration: usize, is_final: bool) {
        self.recording = is_final && self.is_enabled();
        self.history = TrainingHistory::default();
    }

    fn on_step(&mut self, record: &StepRecord<'_>) {
        if !self.recording {
            return;
        }
        if self.save_params {
            self.history.params.push(record.params.clone());
        }
        if self.save_sims
            && let Some(sims) = record.sims
        {
            let mut scaled = sims.to_owned();
            for (mut image, &norm) in scaled.outer_iter_mut().zip(record.norms) {
                image *= norm;
            }
            self.history.sims.push(scaled);
        }
    }
}

/// Forwards every call to two observers.
pub(crate) struct Tee<'a, A: ?Sized, B: ?Sized>(pub &'a mut A, pub &'a mut B);

impl<A: StepObserver + ?Sized, B: StepObserver + ?Sized> StepObserver for Tee<'_, A, B> {
    fn wants_sims(&self) -> bool {
        self.0.wants_sims() || self.1.wants_sims()
    }

    fn on_fit_start(&mut self, iteration: usize, is_final: bool) {
        self.0.on_fit_start(iteration, is_final);
        self.1.on_fit_start(iteration, is_final);
    }

    fn on_step(&mut self, record: &StepRecord<'_>) {
        self.0.on_step(record);
        self.1.on_step(record);
    }
}
