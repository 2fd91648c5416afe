//! # Lock-Free Latency Histogram
//!
//! A fixed-bucket histogram that many workers can write to concurrently
//! while a single reader takes point-in-time snapshots of it.
//!
//! ## Layout
//!
//! The histogram is defined by an ordered list of upper bounds (in
//! milliseconds). `n` bounds produce `n + 1` buckets; the last one is the
//! overflow bucket and catches everything above the largest bound. A value
//! equal to a bound lands in the bucket that bound closes (inclusive upper
//! bound).
//!
//! Every field is an independent `AtomicU64`:
//!
//! - one counter per bucket
//! - the total observation count
//! - the running sum, stored as fixed-point nanoseconds
//! - the running maximum, also fixed-point nanoseconds, updated with a
//!   compare-and-swap loop
//!
//! No lock is ever taken. Each field lives on its own cache line so workers
//! recording into different buckets do not contend.
//!
//! ## Snapshots
//!
//! [`Histogram::snapshot`] loads every field; [`Histogram::snapshot_and_reset`]
//! swaps every field with zero. Either way each field is read exactly once
//! with a single atomic operation, so an observation racing a reset is
//! counted on one side of the boundary and never twice. The fields are not
//! captured as one transaction, so a snapshot taken under load may show a
//! small skew between `count` and the bucket total.

use anyhow::{bail, Result};
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::quantile;

/// Default bucket upper bounds in milliseconds.
///
/// Kept short on purpose: every observation touches exactly one bucket and
/// a quantile query walks all of them.
pub const DEFAULT_BOUNDS_MS: [f64; 15] = [
    0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0,
    10000.0,
];

/// Fixed-point scale for sum and max: nanoseconds per millisecond.
const NANOS_PER_MS: f64 = 1_000_000.0;

/// Check that `bounds` can be used as a bucket layout.
///
/// Bounds must be non-empty, finite, positive and strictly increasing.
pub fn validate_bounds(bounds: &[f64]) -> Result<()> {
    if bounds.is_empty() {
        bail!("Histogram needs at least one bucket bound");
    }
    for (i, &bound) in bounds.iter().enumerate() {
        if !bound.is_finite() || bound <= 0.0 {
            bail!("Bucket bound {} must be a positive finite number", bound);
        }
        if i > 0 && bound <= bounds[i - 1] {
            bail!(
                "Bucket bounds must be strictly increasing ({} follows {})",
                bound,
                bounds[i - 1]
            );
        }
    }
    Ok(())
}

/// Index of the first bound that is not less than `value_ms`.
///
/// Returns `bounds.len()` (the overflow bucket) when `value_ms` exceeds
/// every bound.
#[inline]
pub fn bucket_index(bounds: &[f64], value_ms: f64) -> usize {
    bounds.partition_point(|&bound| bound < value_ms)
}

/// Raise `register` to `value` unless it already holds something larger.
#[inline]
pub(crate) fn update_atomic_max(register: &AtomicU64, value: u64) {
    let mut current = register.load(Ordering::Relaxed);
    while value > current {
        match register.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

/// Negative and non-finite latencies cannot come from a monotonic clock;
/// record them as zero rather than corrupting the sum.
#[inline]
fn sanitize(value_ms: f64) -> f64 {
    if !value_ms.is_finite() || value_ms < 0.0 {
        0.0
    } else {
        value_ms
    }
}

#[inline]
fn to_fixed(value_ms: f64) -> u64 {
    (value_ms * NANOS_PER_MS).round() as u64
}

#[inline]
fn from_fixed(value: u64) -> f64 {
    value as f64 / NANOS_PER_MS
}

/// Concurrent fixed-bucket latency histogram.
#[derive(Debug)]
pub struct Histogram {
    bounds: Arc<[f64]>,
    counts: Box<[CachePadded<AtomicU64>]>,
    count: CachePadded<AtomicU64>,
    sum_ns: CachePadded<AtomicU64>,
    max_ns: CachePadded<AtomicU64>,
}

impl Histogram {
    /// Create an empty histogram over `bounds` (milliseconds).
    pub fn new(bounds: &[f64]) -> Result<Self> {
        validate_bounds(bounds)?;
        Ok(Self::from_validated(bounds))
    }

    /// Create a histogram using [`DEFAULT_BOUNDS_MS`].
    pub fn with_default_bounds() -> Self {
        Self::from_validated(&DEFAULT_BOUNDS_MS)
    }

    fn from_validated(bounds: &[f64]) -> Self {
        Self {
            bounds: Arc::from(bounds),
            counts: (0..=bounds.len())
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            count: CachePadded::new(AtomicU64::new(0)),
            sum_ns: CachePadded::new(AtomicU64::new(0)),
            max_ns: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Bucket upper bounds in milliseconds.
    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Record one latency value in milliseconds.
    #[inline]
    pub fn observe(&self, value_ms: f64) {
        let value_ms = sanitize(value_ms);
        let fixed = to_fixed(value_ms);

        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ns.fetch_add(fixed, Ordering::Relaxed);
        update_atomic_max(&self.max_ns, fixed);

        let idx = bucket_index(&self.bounds, value_ms);
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Non-destructive point-in-time copy.
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds: Arc::clone(&self.bounds),
            count: self.count.load(Ordering::Relaxed),
            sum_ms: from_fixed(self.sum_ns.load(Ordering::Relaxed)),
            max_ms: from_fixed(self.max_ns.load(Ordering::Relaxed)),
            bucket_counts: self
                .counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
        }
    }

    /// Drain the histogram: every field is swapped with zero and its former
    /// value returned in the snapshot.
    pub fn snapshot_and_reset(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds: Arc::clone(&self.bounds),
            count: self.count.swap(0, Ordering::Relaxed),
            sum_ms: from_fixed(self.sum_ns.swap(0, Ordering::Relaxed)),
            max_ms: from_fixed(self.max_ns.swap(0, Ordering::Relaxed)),
            bucket_counts: self
                .counts
                .iter()
                .map(|c| c.swap(0, Ordering::Relaxed))
                .collect(),
        }
    }
}

/// Immutable copy of a [`Histogram`]'s state.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    bounds: Arc<[f64]>,
    bucket_counts: Vec<u64>,
    sum_ms: f64,
    count: u64,
    max_ms: f64,
}

impl HistogramSnapshot {
    /// Assemble a snapshot from raw parts.
    ///
    /// `bucket_counts` must hold `bounds.len() + 1` entries.
    pub fn from_parts(
        bounds: &[f64],
        bucket_counts: Vec<u64>,
        sum_ms: f64,
        count: u64,
        max_ms: f64,
    ) -> Result<Self> {
        validate_bounds(bounds)?;
        if bucket_counts.len() != bounds.len() + 1 {
            bail!(
                "Expected {} bucket counts for {} bounds, got {}",
                bounds.len() + 1,
                bounds.len(),
                bucket_counts.len()
            );
        }
        Ok(Self {
            bounds: Arc::from(bounds),
            bucket_counts,
            sum_ms,
            count,
            max_ms,
        })
    }

    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Per-bucket (non-cumulative) counts; the last entry is the overflow bucket.
    pub fn bucket_counts(&self) -> &[u64] {
        &self.bucket_counts
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum_ms(&self) -> f64 {
        self.sum_ms
    }

    pub fn max_ms(&self) -> f64 {
        self.max_ms
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Arithmetic mean of the observed values, or 0 when empty.
    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms / self.count as f64
        }
    }

    /// Approximate quantile; see [`quantile::estimate`].
    pub fn quantile(&self, q: f64) -> f64 {
        quantile::estimate(self, q)
    }

    /// Running cumulative counts paired with their upper bound.
    ///
    /// The overflow bucket is reported with an upper bound of `None`
    /// (`+Inf` in histogram exposition formats).
    pub fn cumulative_buckets(&self) -> Vec<(Option<f64>, u64)> {
        let mut cumulative = 0u64;
        self.bucket_counts
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                cumulative += c;
                (self.bounds.get(i).copied(), cumulative)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn small() -> Histogram {
        Histogram::new(&[1.0, 2.0, 5.0]).unwrap()
    }

    #[test]
    fn test_validate_bounds() {
        assert!(validate_bounds(&[1.0, 2.0, 5.0]).is_ok());
        assert!(validate_bounds(&DEFAULT_BOUNDS_MS).is_ok());
        assert!(validate_bounds(&[]).is_err());
        assert!(validate_bounds(&[0.0, 1.0]).is_err());
        assert!(validate_bounds(&[-1.0, 1.0]).is_err());
        assert!(validate_bounds(&[1.0, 1.0]).is_err());
        assert!(validate_bounds(&[2.0, 1.0]).is_err());
        assert!(validate_bounds(&[1.0, f64::INFINITY]).is_err());
        assert!(validate_bounds(&[f64::NAN]).is_err());
    }

    #[test]
    fn test_bucket_index_inclusive_upper_bound() {
        let bounds = [1.0, 2.0, 5.0];
        assert_eq!(bucket_index(&bounds, 0.0), 0);
        assert_eq!(bucket_index(&bounds, 0.8), 0);
        assert_eq!(bucket_index(&bounds, 1.0), 0);
        assert_eq!(bucket_index(&bounds, 1.2), 1);
        assert_eq!(bucket_index(&bounds, 2.0), 1);
        assert_eq!(bucket_index(&bounds, 5.0), 2);
        assert_eq!(bucket_index(&bounds, 5.0001), 3);
        assert_eq!(bucket_index(&bounds, 10.0), 3);
    }

    #[test]
    fn test_observe_updates_every_field() {
        let h = small();
        h.observe(0.8);
        h.observe(1.2);
        h.observe(10.0);

        let snap = h.snapshot();
        assert_eq!(snap.count(), 3);
        assert_eq!(snap.bucket_counts(), &[1, 1, 0, 1]);
        assert!((snap.sum_ms() - 12.0).abs() < 1e-9);
        assert_eq!(snap.max_ms(), 10.0);
        assert!((snap.mean_ms() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_is_non_destructive() {
        let h = small();
        h.observe(3.0);
        let first = h.snapshot();
        let second = h.snapshot();
        assert_eq!(first, second);
        assert_eq!(second.count(), 1);
    }

    #[test]
    fn test_snapshot_and_reset_drains() {
        let h = small();
        h.observe(0.5);
        h.observe(7.0);

        let drained = h.snapshot_and_reset();
        assert_eq!(drained.count(), 2);
        assert_eq!(drained.max_ms(), 7.0);

        let after = h.snapshot();
        assert_eq!(after.count(), 0);
        assert_eq!(after.max_ms(), 0.0);
        assert_eq!(after.sum_ms(), 0.0);
        assert!(after.bucket_counts().iter().all(|&c| c == 0));
    }

    #[test]
    fn test_max_restarts_after_reset() {
        let h = small();
        h.observe(9.0);
        h.snapshot_and_reset();
        h.observe(0.3);
        assert_eq!(h.snapshot().max_ms(), 0.3);
    }

    #[test]
    fn test_negative_and_nan_recorded_as_zero() {
        let h = small();
        h.observe(-4.0);
        h.observe(f64::NAN);
        let snap = h.snapshot();
        assert_eq!(snap.count(), 2);
        assert_eq!(snap.bucket_counts()[0], 2);
        assert_eq!(snap.sum_ms(), 0.0);
    }

    #[test]
    fn test_sub_microsecond_precision() {
        let h = small();
        h.observe(0.000_4);
        h.observe(0.000_6);
        assert!((h.snapshot().sum_ms() - 0.001).abs() < 1e-6);
    }

    #[test]
    fn test_cumulative_buckets() {
        let h = small();
        for v in [0.1, 0.2, 1.5, 4.0, 4.5, 100.0] {
            h.observe(v);
        }
        let cumulative = h.snapshot().cumulative_buckets();
        assert_eq!(
            cumulative,
            vec![(Some(1.0), 2), (Some(2.0), 3), (Some(5.0), 5), (None, 6)]
        );
    }

    #[test]
    fn test_from_parts_checks_lengths() {
        assert!(HistogramSnapshot::from_parts(&[1.0], vec![0, 0], 0.0, 0, 0.0).is_ok());
        assert!(HistogramSnapshot::from_parts(&[1.0], vec![0], 0.0, 0, 0.0).is_err());
    }

    #[test]
    fn test_concurrent_observe_keeps_counts_consistent() {
        let h = Arc::new(Histogram::with_default_bounds());
        let mut handles = vec![];

        for t in 0..8 {
            let h = Arc::clone(&h);
            handles.push(thread::spawn(move || {
                for i in 0..5_000 {
                    h.observe(((i % 200) as f64) * 0.1 + t as f64);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = h.snapshot();
        assert_eq!(snap.count(), 40_000);
        assert_eq!(snap.bucket_counts().iter().sum::<u64>(), snap.count());
        assert!((snap.max_ms() - 26.9).abs() < 1e-9);
    }

    #[test]
    fn test_reset_under_concurrent_writers_loses_nothing() {
        let h = Arc::new(small());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let h = Arc::clone(&h);
                thread::spawn(move || {
                    for i in 0..20_000 {
                        h.observe((i % 7) as f64);
                    }
                })
            })
            .collect();

        let mut drained = 0u64;
        let mut drained_buckets = 0u64;
        while writers.iter().any(|w| !w.is_finished()) {
            let snap = h.snapshot_and_reset();
            drained += snap.count();
            drained_buckets += snap.bucket_counts().iter().sum::<u64>();
        }
        for w in writers {
            w.join().unwrap();
        }
        let last = h.snapshot_and_reset();
        drained += last.count();
        drained_buckets += last.bucket_counts().iter().sum::<u64>();

        assert_eq!(drained, 80_000);
        assert_eq!(drained_buckets, 80_000);
    }
}
