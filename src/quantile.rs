//! # Quantile Estimation
//!
//! Two ways to turn recorded latencies into percentiles:
//!
//! - [`estimate`]: the default. Works on a [`HistogramSnapshot`] in
//!   O(buckets) time with no raw samples. It returns the upper bound of the
//!   bucket in which the requested rank falls, so the answer is never lower
//!   than the true percentile and is off by at most one bucket width. Memory
//!   stays constant however long the run is.
//! - [`exact`]: nearest-rank over a sorted slice of raw samples. Exact, but
//!   costs O(n) memory for the samples and O(n log n) per report to sort
//!   them. Only used for the optional final-summary cross-check fed by a
//!   [`SampleRecorder`]; nothing else depends on raw samples.

use parking_lot::Mutex;

use crate::histogram::HistogramSnapshot;

/// Clamp `q` into `[0, 1]`. NaN is treated as 0.
#[inline]
pub fn clamp_quantile(q: f64) -> f64 {
    if q.is_nan() {
        0.0
    } else {
        q.clamp(0.0, 1.0)
    }
}

/// Approximate the `q`-quantile (`0.0..=1.0`) of a histogram snapshot.
///
/// The target rank is `ceil(count * q)`, at least 1. Buckets are walked in
/// order until the cumulative count reaches it:
///
/// - a finite bucket yields its upper bound;
/// - the overflow bucket yields the running maximum;
/// - the bucket holding the largest observation also yields the running
///   maximum, which is exact and never above that bucket's bound.
///
/// The last rule departs from a plain "upper bound of the bucket" answer: a
/// rank landing in the last non-empty finite bucket returns the observed
/// max rather than that bucket's bound. This keeps `estimate(s, 1.0)` equal
/// to `s.max_ms()` and the result monotone in `q`, since no earlier bucket's
/// bound can exceed a max that lies in a later bucket. Every other finite
/// bucket still answers with its bound.
///
/// A snapshot whose count ran ahead of its buckets under concurrent writes
/// also falls back to the running maximum. An empty snapshot yields 0.
pub fn estimate(snapshot: &HistogramSnapshot, q: f64) -> f64 {
    let count = snapshot.count();
    if count == 0 {
        return 0.0;
    }

    let q = clamp_quantile(q);
    let target = ((count as f64 * q).ceil() as u64).max(1);
    let bounds = snapshot.bounds();
    let buckets = snapshot.bucket_counts();
    let bucket_total: u64 = buckets.iter().sum();

    let mut cumulative = 0u64;
    for (i, &c) in buckets.iter().enumerate() {
        cumulative += c;
        if cumulative >= target {
            if i >= bounds.len() || cumulative >= bucket_total {
                return snapshot.max_ms();
            }
            return bounds[i];
        }
    }

    // Snapshot skew: count ran ahead of the buckets.
    snapshot.max_ms()
}

/// Nearest-rank quantile over ascending `sorted` samples.
///
/// Returns 0 for an empty slice.
pub fn exact(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let q = clamp_quantile(q);
    if q <= 0.0 {
        return sorted[0];
    }
    if q >= 1.0 {
        return sorted[sorted.len() - 1];
    }
    let idx = ((q * sorted.len() as f64).ceil() as usize).saturating_sub(1);
    sorted[idx.min(sorted.len() - 1)]
}

/// Raw latency sample store for exact percentiles.
///
/// Every sample is kept for the lifetime of the run and recording takes a
/// short mutex, so this is meant for low-throughput runs where an exact
/// answer is worth O(n) memory.
#[derive(Debug, Default)]
pub struct SampleRecorder {
    samples: Mutex<Vec<f64>>,
}

impl SampleRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, value_ms: f64) {
        self.samples.lock().push(value_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted copy of everything recorded so far.
    pub fn sorted(&self) -> Vec<f64> {
        let mut sorted = self.samples.lock().clone();
        sorted.sort_unstable_by(f64::total_cmp);
        sorted
    }

    /// Exact values for each of `quantiles`, in the same order.
    pub fn quantiles(&self, quantiles: &[f64]) -> Vec<f64> {
        let sorted = self.sorted();
        quantiles.iter().map(|&q| exact(&sorted, q)).collect()
    }
}
