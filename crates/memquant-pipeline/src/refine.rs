//! Boundary refinement from fitted offsets.

use crate::geometry::{interp_roi, offset_coordinates, rotate_roi};
use crate::types::{GeometryError, Roi};

/// Move each ROI point outward by its offset, re-space the points
/// evenly and, for closed boundaries with `rotate`, restart the point
/// order at the end of the long axis.
///
/// `offsets` has one value per ROI point.
///
/// # Errors
///
/// Propagates geometry errors from the normal computation or
/// re-spacing.
pub fn refine(roi: &Roi, offsets: &[f64], periodic: bool, rotate: bool) -> Result<Roi, GeometryError> {
    let moved = offset_coordinates(roi, offsets, periodic)?;
    let even = interp_roi(&moved, periodic)?;
    Ok(if rotate && periodic {
        rotate_roi(&even)
    } else {
        even
    })
}

/// Mean and maximum distance between matching points of two ROIs.
#[must_use]
pub fn displacement(before: &Roi, after: &Roi) -> (f64, f64) {
    let distances: Vec<f64> = before
        .points()
        .iter()
        .zip(after.points())
        .map(|(a, b)| a.distance(*b))
        .collect();
    if distances.is_empty() {
        return (0.0, 0.0);
    }
    #[allow(clippy::cast_precision_loss)]
    let mean = distances.iter().sum::<f64>() / distances.len() as f64;
    let max = distances.iter().copied().fold(0.0, f64::max);
    (mean, max)
}
