//! ROI geometry: normals, normal offsetting, even re-spacing and
//! start-point rotation.
//!
//! Normals are the unit tangent rotated a quarter turn from +x towards
//! +y. For a circle traced with increasing `atan2(y - cy, x - cx)` they
//! point at the center, which is the direction cross-sections are
//! sampled in (outside first). "Outward" below is the opposite
//! direction.

use crate::types::{GeometryError, Point, Roi};

/// Minimum number of points for any ROI operation.
pub const MIN_ROI_POINTS: usize = 3;

/// Check that an ROI has enough points and only finite coordinates.
///
/// # Errors
///
/// Returns [`GeometryError::TooFewPoints`] or
/// [`GeometryError::NonFinite`].
pub fn validate(roi: &Roi) -> Result<(), GeometryError> {
    if roi.len() < MIN_ROI_POINTS {
        return Err(GeometryError::TooFewPoints {
            found: roi.len(),
            required: MIN_ROI_POINTS,
        });
    }
    if let Some(index) = roi.points().iter().position(|p| !p.is_finite()) {
        return Err(GeometryError::NonFinite { index });
    }
    Ok(())
}

/// Unit sampling normal at every ROI point.
///
/// Tangents are central differences; open curves use one-sided
/// differences at their ends.
///
/// # Errors
///
/// Returns [`GeometryError::DegenerateNormal`] where the tangent has
/// zero length, plus any [`validate`] error.
pub fn normals(roi: &Roi, periodic: bool) -> Result<Vec<Point>, GeometryError> {
    validate(roi)?;
    let pts = roi.points();
    let n = pts.len();

    (0..n)
        .map(|i| {
            let (prev, next) = if periodic {
                (pts[(i + n - 1) % n], pts[(i + 1) % n])
            } else {
                (pts[i.saturating_sub(1)], pts[(i + 1).min(n - 1)])
            };
            let tx = next.x - prev.x;
            let ty = next.y - prev.y;
            let len = tx.hypot(ty);
            if len <= f64::EPSILON || !len.is_finite() {
                return Err(GeometryError::DegenerateNormal { index: i });
            }
            Ok(Point::new(-ty / len, tx / len))
        })
        .collect()
}

/// Move every point outward along its normal by the matching offset.
///
/// Negative offsets move inward. `offsets` shorter than the ROI leave
/// the remaining points in place.
///
/// # Errors
///
/// Propagates [`normals`] errors.
pub fn offset_coordinates(roi: &Roi, offsets: &[f64], periodic: bool) -> Result<Roi, GeometryError> {
    let normals = normals(roi, periodic)?;
    let moved = roi
        .points()
        .iter()
        .zip(&normals)
        .enumerate()
        .map(|(i, (p, n))| {
            let d = offsets.get(i).copied().unwrap_or(0.0);
            Point::new(n.x.mul_add(-d, p.x), n.y.mul_add(-d, p.y))
        })
        .collect();
    Ok(Roi::new(moved))
}

/// Re-space points evenly by arc length, keeping the point count.
///
/// Closed curves include the segment from the last point back to the
/// first and do not repeat the start point. Open curves keep both
/// endpoints.
///
/// # Errors
///
/// Returns [`GeometryError::DegenerateNormal`] when the curve has zero
/// length, plus any [`validate`] error.
pub fn interp_roi(roi: &Roi, periodic: bool) -> Result<Roi, GeometryError> {
    validate(roi)?;
    let mut pts = roi.points().to_vec();
    let n = pts.len();
    if periodic {
        pts.push(pts[0]);
    }

    let mut cumulative = Vec::with_capacity(pts.len());
    let mut total = 0.0;
    cumulative.push(0.0);
    for w in pts.windows(2) {
        total += w[0].distance(w[1]);
        cumulative.push(total);
    }
    if total <= f64::EPSILON {
        return Err(GeometryError::DegenerateNormal { index: 0 });
    }

    #[allow(clippy::cast_precision_loss)]
    let step = if periodic {
        total / n as f64
    } else {
        total / (n - 1) as f64
    };

    let mut out = Vec::with_capacity(n);
    let mut seg = 0;
    for k in 0..n {
        #[allow(clippy::cast_precision_loss)]
        let target = (step * k as f64).min(total);
        while seg + 2 < cumulative.len() && cumulative[seg + 1] < target {
            seg += 1;
        }
        let span = cumulative[seg + 1] - cumulative[seg];
        let t = if span > 0.0 {
            ((target - cumulative[seg]) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let a = pts[seg];
        let b = pts[seg + 1];
        out.push(Point::new((b.x - a.x).mul_add(t, a.x), (b.y - a.y).mul_add(t, a.y)));
    }
    Ok(Roi::new(out))
}

/// Rotate a closed ROI's point order so it starts at the end of its
/// long axis.
///
/// The long axis is the principal axis of the point cloud; the new
/// start is the point with the largest projection onto it.
#[must_use]
pub fn rotate_roi(roi: &Roi) -> Roi {
    let pts = roi.points();
    if pts.len() < 2 {
        return roi.clone();
    }

    #[allow(clippy::cast_precision_loss)]
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p.y).sum::<f64>() / n;
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for p in pts {
        let dx = p.x - cx;
        let dy = p.y - cy;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    let angle = 0.5 * (2.0 * sxy).atan2(sxx - syy);
    let (ay, ax) = angle.sin_cos();

    let start = pts
        .iter()
        .map(|p| (p.x - cx).mul_add(ax, (p.y - cy) * ay))
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(0, |(i, _)| i);

    let mut rotated = pts.to_vec();
    rotated.rotate_left(start);
    Roi::new(rotated)
}
