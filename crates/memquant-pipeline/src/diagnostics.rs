//! Run diagnostics: timing, losses and boundary movement for each
//! iteration.
//!
//! Every [`Quantifier::run`](crate::Quantifier::run) collects these
//! alongside the fitted results. Timestamps are captured with the
//! `web-time` crate, which uses `performance.now()` on WASM and
//! `std::time::Instant` on native.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single quantification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// One entry per sample-fit(-refine) round, in order.
    pub iterations: Vec<IterationDiagnostics>,
    /// Total wall-clock duration of the run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary of the final fit.
    pub summary: RunSummary,
}

/// Diagnostics for one outer iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationDiagnostics {
    /// Zero-based iteration index.
    pub iteration: usize,
    /// Profile sampling.
    pub sampling: StageDiagnostics,
    /// Gradient descent.
    pub optimizing: StageDiagnostics,
    /// Boundary refinement (absent for the final iteration).
    pub refining: Option<StageDiagnostics>,
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Profile sampling metrics.
    Sampling {
        /// Images in the batch.
        images: usize,
        /// Samples across the cortex.
        thickness: usize,
        /// Padded column count.
        width: usize,
        /// Smallest normalization factor.
        min_norm: f64,
        /// Largest normalization factor.
        max_norm: f64,
    },
    /// Gradient descent metrics.
    Optimizing {
        /// Descent steps taken.
        steps: usize,
        /// Batch-mean loss at the first step.
        first_loss: f64,
        /// Batch-mean loss at the last step.
        final_loss: f64,
        /// Kernel width after the fit.
        sigma: f64,
    },
    /// Boundary refinement metrics.
    Refining {
        /// Mean point displacement over all images (pixels).
        mean_displacement: f64,
        /// Largest point displacement (pixels).
        max_displacement: f64,
    },
}

/// High-level summary of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Images quantified.
    pub images: usize,
    /// Outer iterations run.
    pub iterations: usize,
    /// Descent steps per fit.
    pub descent_steps: usize,
    /// Batch-mean loss at the end of the final fit.
    pub final_loss: f64,
    /// Final kernel width.
    pub sigma: f64,
}

impl RunDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Quantification Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Images: {}  |  Iterations: {}  |  Steps per fit: {}",
            self.summary.images, self.summary.iterations, self.summary.descent_steps,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<20} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);

        for it in &self.iterations {
            let mut stages = vec![("Sampling", &it.sampling), ("Optimizing", &it.optimizing)];
            if let Some(ref r) = it.refining {
                stages.push(("Refining", r));
            }
            for (name, diag) in stages {
                let ms = duration_ms(diag.duration);
                let pct = if total_ms > 0.0 {
                    ms / total_ms * 100.0
                } else {
                    0.0
                };
                let label = format!("[{}] {name}", it.iteration);
                let details = format_metrics(&diag.metrics);
                lines.push(format!("{label:<20} {ms:>8.3}ms {pct:>9.1}%  {details}"));
            }
        }

        lines.push(String::new());
        lines.push(format!(
            "Final loss: {:.6}  |  Sigma: {:.4}",
            self.summary.final_loss, self.summary.sigma,
        ));

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Sampling {
            images,
            thickness,
            width,
            min_norm,
            max_norm,
        } => {
            format!("{images} x {thickness}x{width} norm={min_norm:.3}..{max_norm:.3}")
        }
        StageMetrics::Optimizing {
            steps,
            first_loss,
            final_loss,
            sigma,
        } => {
            format!("{steps} steps loss {first_loss:.6}->{final_loss:.6} sigma={sigma:.3}")
        }
        StageMetrics::Refining {
            mean_displacement,
            max_displacement,
        } => {
            format!("moved mean={mean_displacement:.3}px max={max_displacement:.3}px")
        }
    }
}
