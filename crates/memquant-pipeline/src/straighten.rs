//! Image straightening along an ROI and along-boundary smoothing.

use ndarray::{Array2, ArrayView2};

use crate::geometry;
use crate::interp::bicubic;
use crate::types::{Frame, GeometryError, Roi};

/// Sample `thickness` points across the boundary at every ROI point.
///
/// Returns a `thickness x roi.len()` array. Row `r` of column `j` is
/// the image at `roi[j] + (r - thickness / 2) * normal[j]`, so the ROI
/// itself sits at row `thickness / 2` and row 0 lies outside the cell.
///
/// # Errors
///
/// Propagates [`geometry::normals`] errors.
pub fn straighten(
    frame: &Frame,
    roi: &Roi,
    thickness: usize,
    periodic: bool,
) -> Result<Array2<f64>, GeometryError> {
    let normals = geometry::normals(roi, periodic)?;
    let image = frame.view();
    #[allow(clippy::cast_precision_loss)]
    let half = thickness as f64 / 2.0;

    let mut out = Array2::zeros((thickness, roi.len()));
    for (j, (p, n)) in roi.points().iter().zip(&normals).enumerate() {
        for r in 0..thickness {
            #[allow(clippy::cast_precision_loss)]
            let d = r as f64 - half;
            out[[r, j]] = bicubic(image, n.x.mul_add(d, p.x), n.y.mul_add(d, p.y));
        }
    }
    Ok(out)
}

/// Centered rolling mean of `window` columns along the boundary axis.
///
/// Closed boundaries wrap around. Open boundaries average only the
/// columns that exist, so the ends use a shorter window. For even
/// windows the extra column is taken on the left.
#[must_use]
pub fn rolling_average(profile: ArrayView2<'_, f64>, window: usize, periodic: bool) -> Array2<f64> {
    let (rows, cols) = profile.dim();
    if window <= 1 || cols == 0 {
        return profile.to_owned();
    }
    let window = if periodic { window.min(cols) } else { window };
    let left = window / 2;
    let right = window - 1 - left;

    let mut out = Array2::zeros((rows, cols));
    for j in 0..cols {
        if periodic {
            #[allow(clippy::cast_precision_loss)]
            let count = window as f64;
            for r in 0..rows {
                let sum: f64 = (0..window)
                    .map(|k| profile[[r, (j + cols + k - left) % cols]])
                    .sum();
                out[[r, j]] = sum / count;
            }
        } else {
            let lo = j.saturating_sub(left);
            let hi = (j + right).min(cols - 1);
            #[allow(clippy::cast_precision_loss)]
            let count = (hi - lo + 1) as f64;
            for r in 0..rows {
                let sum: f64 = (lo..=hi).map(|k| profile[[r, k]]).sum();
                out[[r, j]] = sum / count;
            }
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::circle_roi;
    use crate::types::Point;
    use ndarray::array;

    #[test]
    fn straighten_shape_and_orientation() {
        // Intensity rises with x; a vertical line traced towards -y has
        // its sampling normal pointing towards +x.
        let frame = Frame::new(Array2::from_shape_fn((30, 30), |(_, x)| x as f64));
        let roi = Roi::from_xy(&[(15.0, 20.0), (15.0, 15.0), (15.0, 10.0)]);
        let out = straighten(&frame, &roi, 10, false).unwrap();
        assert_eq!(out.dim(), (10, 3));
        for j in 0..3 {
            // Row 5 is on the ROI; row 0 is 5 px along -x.
            assert!((out[[5, j]] - 15.0).abs() < 1e-9);
            assert!((out[[0, j]] - 10.0).abs() < 1e-9);
            assert!((out[[9, j]] - 19.0).abs() < 1e-9);
        }
    }

    #[test]
    fn straighten_circle_crosses_edge_at_center_row() {
        let center = Point::new(25.0, 25.0);
        let frame = Frame::new(Array2::from_shape_fn((50, 50), |(y, x)| {
            let d = Point::new(x as f64, y as f64).distance(center);
            if d < 10.0 { 1.0 } else { 0.0 }
        }));
        let roi = circle_roi(center, 10.0, 24);
        let out = straighten(&frame, &roi, 20, true).unwrap();
        for j in 0..24 {
            assert!(out[[2, j]].abs() < 0.1, "outside row not dark");
            assert!((out[[18, j]] - 1.0).abs() < 0.1, "inside row not bright");
        }
    }

    #[test]
    fn straighten_propagates_geometry_errors() {
        let frame = Frame::new(Array2::zeros((5, 5)));
        let roi = Roi::from_xy(&[(1.0, 1.0), (2.0, 2.0)]);
        assert!(straighten(&frame, &roi, 4, true).is_err());
    }

    #[test]
    fn rolling_average_periodic_wraps() {
        let profile = array![[3.0, 0.0, 0.0, 0.0, 0.0, 0.0]];
        let out = rolling_average(profile.view(), 3, true);
        assert!((out[[0, 0]] - 1.0).abs() < 1e-12);
        assert!((out[[0, 1]] - 1.0).abs() < 1e-12);
        assert!((out[[0, 5]] - 1.0).abs() < 1e-12);
        assert!(out[[0, 3]].abs() < 1e-12);
        // Periodic smoothing conserves the row sum.
        assert!((out.sum() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn rolling_average_open_truncates() {
        let profile = array![[0.0, 3.0, 6.0, 9.0]];
        let out = rolling_average(profile.view(), 3, false);
        assert!((out[[0, 0]] - 1.5).abs() < 1e-12);
        assert!((out[[0, 1]] - 3.0).abs() < 1e-12);
        assert!((out[[0, 3]] - 7.5).abs() < 1e-12);
    }

    #[test]
    fn rolling_average_window_one_is_identity() {
        let profile = array![[1.0, 2.0], [3.0, 4.0]];
        assert_eq!(rolling_average(profile.view(), 1, true), profile);
    }
}
