//! Synthetic cortex images for tests.
//!
//! Intensities follow the same membrane-plus-cytoplasm profile the
//! curve model fits, as a function of signed distance `z` from the
//! boundary (positive inside the cell).

#![allow(clippy::cast_precision_loss)]

use ndarray::Array2;

use crate::types::{Frame, Point, Roi};

/// Cross-section intensity at signed distance `z` from the boundary.
pub fn cortex_profile(z: f64, mem: f64, cyt: f64, sigma: f64) -> f64 {
    let membrane = (-z * z / (2.0 * sigma * sigma)).exp();
    let cytoplasm = 0.5 * (1.0 + libm::erf(z / sigma));
    mem.mul_add(membrane, cyt * cytoplasm)
}

/// `n` points on a circle, traced with increasing angle so sampling
/// normals point at the center.
pub fn circle_roi(center: Point, radius: f64, n: usize) -> Roi {
    Roi::new(
        (0..n)
            .map(|i| {
                let t = std::f64::consts::TAU * i as f64 / n as f64;
                Point::new(radius.mul_add(t.cos(), center.x), radius.mul_add(t.sin(), center.y))
            })
            .collect(),
    )
}

/// `size x size` image of a round cell with its cortex at `radius`.
pub fn circle_frame(size: usize, center: Point, radius: f64, mem: f64, cyt: f64, sigma: f64) -> Frame {
    Frame::new(Array2::from_shape_fn((size, size), |(y, x)| {
        let z = radius - Point::new(x as f64, y as f64).distance(center);
        cortex_profile(z, mem, cyt, sigma)
    }))
}

/// `n` evenly spaced points along `y = row` from `x0` to `x1`. Traced
/// towards +x, the sampling normal points towards +y.
pub fn line_roi(x0: f64, x1: f64, row: f64, n: usize) -> Roi {
    Roi::new(
        crate::interp::linspace(x0, x1, n)
            .map(|x| Point::new(x, row))
            .collect(),
    )
}

/// Image of a flat cortex along `y = row` with the cell below it.
pub fn band_frame(width: usize, height: usize, row: f64, mem: f64, cyt: f64, sigma: f64) -> Frame {
    Frame::new(Array2::from_shape_fn((height, width), |(y, _)| {
        cortex_profile(y as f64 - row, mem, cyt, sigma)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circle_frame_peaks_on_boundary() {
        let center = Point::new(25.0, 25.0);
        let frame = circle_frame(50, center, 10.0, 1.0, 0.3, 2.0);
        let on = frame.view()[[25, 35]];
        let inside = frame.view()[[25, 25]];
        let outside = frame.view()[[25, 48]];
        assert!((on - 1.15).abs() < 1e-9);
        assert!(on > inside && inside > outside);
        assert!((inside - 0.3).abs() < 1e-4);
        assert!(outside.abs() < 1e-6);
    }
}
