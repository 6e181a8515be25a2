//! memquant-pipeline: membrane and cytoplasm quantification along cell
//! cortices (sans-IO).
//!
//! Given microscopy frames and a rough boundary (ROI) per frame, the
//! pipeline repeatedly:
//!
//! 1. straightens each frame along its ROI into a cross-section profile
//!    ([`sampler`]),
//! 2. fits every profile column as a Gaussian membrane peak plus an
//!    error-function cytoplasm step, jointly with a smooth boundary
//!    offset, by gradient descent ([`fit`]),
//! 3. moves the ROI by the fitted offsets ([`refine`]).
//!
//! [`Quantifier`] drives the rounds and returns the final fit at ROI
//! resolution. This crate has **no I/O dependencies**: frames and ROIs
//! come in as memory, results go out as serde-serializable values. File
//! handling lives in `memquant-cli`.

pub mod diagnostics;
pub mod fit;
pub mod geometry;
pub mod interp;
pub mod model;
pub mod observer;
pub mod optimizer;
mod parallel;
pub mod quantifier;
pub mod refine;
pub mod results;
pub mod sampler;
pub mod spline;
pub mod straighten;
pub mod types;

#[cfg(test)]
mod test_support;

pub use diagnostics::RunDiagnostics;
pub use model::CurveModel;
pub use observer::{StepObserver, StepRecord, TrainingHistory, TrainingRecorder};
pub use optimizer::{ParamKind, Params};
pub use quantifier::{QuantResult, Quantifier, RunState, quantify};
pub use results::ImageResult;
pub use sampler::ProfileBatch;
pub use types::{Frame, GeometryError, NumericQuantity, Point, QuantConfig, QuantError, Roi};
