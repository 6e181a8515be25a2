//! Per-image data parallelism across a batch.
//!
//! With the `rayon` feature the closure runs on the rayon pool;
//! without it images are processed in order. Results come back in
//! batch order either way.

#[cfg(feature = "rayon")]
use rayon::iter::{IntoParallelIterator, ParallelIterator};

/// Evaluate `op` for every image index `0..n` and collect the results.
#[cfg(feature = "rayon")]
pub fn map_images<T, F>(n: usize, op: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    (0..n).into_par_iter().map(op).collect()
}

/// Evaluate `op` for every image index `0..n` and collect the results.
#[cfg(not(feature = "rayon"))]
pub fn map_images<T, F>(n: usize, op: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    (0..n).map(op).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_keep_batch_order() {
        let out = map_images(64, |i| i * i);
        assert_eq!(out.len(), 64);
        assert!(out.iter().enumerate().all(|(i, &v)| v == i * i));
    }

    #[test]
    fn empty_batch() {
        let out: Vec<usize> = map_images(0, |i| i);
        assert!(out.is_empty());
    }
}
