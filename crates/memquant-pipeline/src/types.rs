//! Shared types for the memquant quantification pipeline.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// A 2D point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (pixels from left edge).
    pub x: f64,
    /// Vertical position (pixels from top edge).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to another point.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_squared(other).sqrt()
    }

    /// Whether both coordinates are finite.
    #[must_use]
    pub const fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// An ordered boundary (region of interest) tracing a cell cortex.
///
/// Cross-sections are sampled along the tangent rotated a quarter turn
/// from +x towards +y (see [`crate::geometry::normals`]), so the
/// boundary must be traced such that this normal points into the cell.
/// A circle traced with increasing `atan2(y - cy, x - cx)` satisfies
/// this. Whether the curve is closed is a property of
/// the run ([`QuantConfig::periodic`]), not of the point list: a closed
/// ROI does not repeat its first point at the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roi(Vec<Point>);

impl Roi {
    /// Create a new ROI from a vector of points.
    #[must_use]
    pub const fn new(points: Vec<Point>) -> Self {
        Self(points)
    }

    /// Build an ROI from `(x, y)` coordinate pairs.
    #[must_use]
    pub fn from_xy(coords: &[(f64, f64)]) -> Self {
        Self(coords.iter().map(|&(x, y)| Point::new(x, y)).collect())
    }

    /// Returns `true` if the ROI has no points.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of points in the ROI.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns a slice of all points.
    #[must_use]
    pub fn points(&self) -> &[Point] {
        &self.0
    }

    /// Consumes the ROI and returns the underlying vector of points.
    #[must_use]
    pub fn into_points(self) -> Vec<Point> {
        self.0
    }
}

/// A single grayscale image frame.
///
/// Intensities are stored row-major as `f64`, indexed `[y, x]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame(Array2<f64>);

impl Frame {
    /// Wrap an intensity array indexed `[y, x]`.
    #[must_use]
    pub const fn new(data: Array2<f64>) -> Self {
        Self(data)
    }

    /// Build a frame from row-major intensities.
    ///
    /// # Errors
    ///
    /// Returns [`QuantError::InvalidConfig`] if `data.len()` is not
    /// `width * height`.
    pub fn from_shape_vec(width: usize, height: usize, data: Vec<f64>) -> Result<Self, QuantError> {
        Array2::from_shape_vec((height, width), data)
            .map(Self)
            .map_err(|e| QuantError::InvalidConfig(format!("frame shape: {e}")))
    }

    /// Convert an 8-bit grayscale image.
    #[must_use]
    pub fn from_gray8(image: &image::GrayImage) -> Self {
        let (w, h) = image.dimensions();
        Self(Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
            #[allow(clippy::cast_possible_truncation)]
            let px = image.get_pixel(x as u32, y as u32);
            f64::from(px.0[0])
        }))
    }

    /// Convert a 16-bit grayscale image.
    #[must_use]
    pub fn from_gray16(image: &image::ImageBuffer<image::Luma<u16>, Vec<u16>>) -> Self {
        let (w, h) = image.dimensions();
        Self(Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
            #[allow(clippy::cast_possible_truncation)]
            let px = image.get_pixel(x as u32, y as u32);
            f64::from(px.0[0])
        }))
    }

    /// Convert any decoded image, keeping 16-bit precision when present.
    ///
    /// Color images are reduced to luma.
    #[must_use]
    pub fn from_dynamic(image: &image::DynamicImage) -> Self {
        match image {
            image::DynamicImage::ImageLuma8(gray) => Self::from_gray8(gray),
            image::DynamicImage::ImageLuma16(gray) => Self::from_gray16(gray),
            other => Self::from_gray16(&other.to_luma16()),
        }
    }

    /// Image width in pixels.
    #[must_use]
    pub fn width(&self) -> usize {
        self.0.ncols()
    }

    /// Image height in pixels.
    #[must_use]
    pub fn height(&self) -> usize {
        self.0.nrows()
    }

    /// Borrow the intensity array.
    #[must_use]
    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.0.view()
    }
}

/// Configuration for a quantification run.
///
/// Defaults match the reference gradient-descent quantifier. Call
/// [`validate`](Self::validate) (done automatically by
/// [`Quantifier::new`](crate::Quantifier::new)) before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantConfig {
    /// Width of the membrane/cytoplasm kernels, in cross-section samples.
    /// Fixed unless `adaptive_sigma` is set, in which case it is the
    /// starting value.
    pub sigma: f64,

    /// Whether the ROI is a closed loop.
    pub periodic: bool,

    /// Number of samples taken across the cortex at each position.
    pub thickness: usize,

    /// Width of the rolling average applied along the boundary.
    pub smoothing_window: usize,

    /// Maximum boundary displacement per iteration, in samples.
    /// Zero disables offset fitting.
    pub freedom: f64,

    /// Number of control points in the offset spline.
    pub roi_knots: usize,

    /// Fixed number of fit positions along the boundary. `None` fits at
    /// every ROI point, padding shorter ROIs in a batch.
    pub nfits: Option<usize>,

    /// Number of sample-fit-refine rounds.
    pub iterations: usize,

    /// Rotate closed ROIs so they start at the end of their long axis.
    pub rotate: bool,

    /// Adam learning rate.
    pub learning_rate: f64,

    /// Gradient descent steps per fit.
    pub descent_steps: usize,

    /// Optimize `sigma` alongside the amplitudes.
    pub adaptive_sigma: bool,

    /// Normalize all images by one batch-wide percentile instead of
    /// each by its own.
    pub batch_norm: bool,

    /// Fit a nonzero baseline on the outer side of the membrane.
    pub fit_outer: bool,

    /// Record the optimized parameters after every descent step.
    pub save_training: bool,

    /// Record the simulated profiles after every descent step.
    pub save_sims: bool,
}

impl QuantConfig {
    /// Default kernel width.
    pub const DEFAULT_SIGMA: f64 = 2.0;
    /// Default cross-section thickness.
    pub const DEFAULT_THICKNESS: usize = 50;
    /// Default rolling-average width.
    pub const DEFAULT_SMOOTHING_WINDOW: usize = 10;
    /// Default maximum offset.
    pub const DEFAULT_FREEDOM: f64 = 10.0;
    /// Default offset spline knot count.
    pub const DEFAULT_ROI_KNOTS: usize = 20;
    /// Default number of fit positions.
    pub const DEFAULT_NFITS: Option<usize> = Some(100);
    /// Default number of refinement rounds.
    pub const DEFAULT_ITERATIONS: usize = 2;
    /// Default Adam learning rate.
    pub const DEFAULT_LEARNING_RATE: f64 = 0.01;
    /// Default number of descent steps.
    pub const DEFAULT_DESCENT_STEPS: usize = 500;

    /// Check option values for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`QuantError::InvalidConfig`] naming the first offending
    /// option.
    pub fn validate(&self) -> Result<(), QuantError> {
        let invalid = |msg: String| Err(QuantError::InvalidConfig(msg));

        if !(self.sigma.is_finite() && self.sigma > 0.0) {
            return invalid(format!("sigma must be positive, got {}", self.sigma));
        }
        if self.thickness < 2 {
            return invalid(format!(
                "thickness must be at least 2, got {}",
                self.thickness
            ));
        }
        if self.smoothing_window == 0 {
            return invalid("smoothing_window must be at least 1".to_string());
        }
        if !(self.freedom.is_finite() && self.freedom >= 0.0) {
            return invalid(format!(
                "freedom must be finite and non-negative, got {}",
                self.freedom
            ));
        }
        if self.roi_knots < 2 {
            return invalid(format!(
                "roi_knots must be at least 2, got {}",
                self.roi_knots
            ));
        }
        if let Some(nfits) = self.nfits
            && nfits < 2
        {
            return invalid(format!("nfits must be at least 2, got {nfits}"));
        }
        if self.iterations == 0 {
            return invalid("iterations must be at least 1".to_string());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            ));
        }
        if self.descent_steps == 0 {
            return invalid("descent_steps must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            sigma: Self::DEFAULT_SIGMA,
            periodic: true,
            thickness: Self::DEFAULT_THICKNESS,
            smoothing_window: Self::DEFAULT_SMOOTHING_WINDOW,
            freedom: Self::DEFAULT_FREEDOM,
            roi_knots: Self::DEFAULT_ROI_KNOTS,
            nfits: Self::DEFAULT_NFITS,
            iterations: Self::DEFAULT_ITERATIONS,
            rotate: false,
            learning_rate: Self::DEFAULT_LEARNING_RATE,
            descent_steps: Self::DEFAULT_DESCENT_STEPS,
            adaptive_sigma: false,
            batch_norm: false,
            fit_outer: false,
            save_training: false,
            save_sims: false,
        }
    }
}

/// Problems with ROI geometry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum GeometryError {
    /// The ROI has fewer points than the operation needs.
    #[error("ROI has {found} points, at least {required} required")]
    TooFewPoints {
        /// Points present.
        found: usize,
        /// Points required.
        required: usize,
    },

    /// A coordinate is NaN or infinite.
    #[error("ROI point {index} has a non-finite coordinate")]
    NonFinite {
        /// Index of the offending point.
        index: usize,
    },

    /// Neighbouring points coincide, so no normal direction exists.
    #[error("ROI normal at point {index} is undefined (zero-length tangent)")]
    DegenerateNormal {
        /// Index of the offending point.
        index: usize,
    },
}

/// Which quantity went non-finite during optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumericQuantity {
    /// The masked mean squared error.
    Loss,
    /// A parameter gradient.
    Gradient,
}

impl std::fmt::Display for NumericQuantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loss => f.write_str("loss"),
            Self::Gradient => f.write_str("gradient"),
        }
    }
}

/// Errors that can occur during quantification.
///
/// Any error aborts the whole batch: all images share one optimizer
/// objective, so a failing image cannot be dropped mid-run.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum QuantError {
    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No frames were supplied.
    #[error("no frames to quantify")]
    EmptyBatch,

    /// The number of ROIs cannot be matched to the number of frames.
    #[error("{rois} ROIs supplied for {frames} frames")]
    ShapeMismatch {
        /// Number of frames.
        frames: usize,
        /// Number of ROIs.
        rois: usize,
    },

    /// An ROI is malformed or degenerate.
    #[error("image {image}: {source}")]
    Geometry {
        /// Batch index of the image.
        image: usize,
        /// Underlying geometry problem.
        #[source]
        source: GeometryError,
    },

    /// The optimization produced a NaN or infinite value.
    #[error("non-finite {quantity} for image {image} at descent step {step}")]
    Numerical {
        /// Descent step (zero-based).
        step: usize,
        /// Batch index of the image.
        image: usize,
        /// What went non-finite.
        quantity: NumericQuantity,
    },
}
