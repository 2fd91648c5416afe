//! # Metrics Aggregator
//!
//! The single shared object every worker records into. It keeps two
//! independently fed horizons:
//!
//! - **lifetime**: grows for the whole run, read non-destructively by the
//!   final summary and by exporters
//! - **window**: drained to zero by the reporter on every tick
//!
//! Window statistics are never derived by diffing lifetime snapshots; each
//! success is observed into both histograms.
//!
//! All counters are relaxed atomics. They are statistics, not
//! synchronization: the only happens-after guarantee in a run comes from
//! joining the worker pool before the final snapshot.

use anyhow::Result;
use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

use crate::histogram::{Histogram, HistogramSnapshot};
use crate::utils;

/// Result of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed; carries the measured wall-clock latency.
    Success(Duration),
    /// Failed; no latency is recorded.
    Failure,
}

impl Outcome {
    /// Build an outcome from a timed call's result.
    pub fn from_result<T, E>(elapsed: Duration, result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Outcome::Success(elapsed),
            Err(_) => Outcome::Failure,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

/// Drained window horizon.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub failures: u64,
    pub histogram: HistogramSnapshot,
}

impl WindowSnapshot {
    /// Window successes equal the window histogram's observation count.
    pub fn successes(&self) -> u64 {
        self.histogram.count()
    }
}

/// Non-destructive lifetime horizon.
#[derive(Debug, Clone)]
pub struct TotalSnapshot {
    pub successes: u64,
    pub failures: u64,
    pub histogram: HistogramSnapshot,
}

/// Lock-free dual-horizon metrics store.
#[derive(Debug)]
pub struct MetricsAggregator {
    lifetime: Histogram,
    window: Histogram,
    lifetime_success: CachePadded<AtomicU64>,
    lifetime_failure: CachePadded<AtomicU64>,
    window_failure: CachePadded<AtomicU64>,
    started_at: Instant,
    started_at_utc: chrono::DateTime<chrono::Utc>,
}

impl MetricsAggregator {
    /// Create an aggregator whose histograms use `bounds` (milliseconds).
    ///
    /// The start timestamp used for throughput is captured here.
    pub fn new(bounds: &[f64]) -> Result<Self> {
        Ok(Self {
            lifetime: Histogram::new(bounds)?,
            window: Histogram::new(bounds)?,
            lifetime_success: CachePadded::new(AtomicU64::new(0)),
            lifetime_failure: CachePadded::new(AtomicU64::new(0)),
            window_failure: CachePadded::new(AtomicU64::new(0)),
            started_at: Instant::now(),
            started_at_utc: chrono::Utc::now(),
        })
    }

    /// Record one outcome. Never blocks.
    #[inline]
    pub fn record(&self, outcome: Outcome) {
        match outcome {
            Outcome::Failure => {
                self.lifetime_failure.fetch_add(1, Ordering::Relaxed);
                self.window_failure.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Success(latency) => {
                let ms = duration_to_ms(latency);
                self.lifetime_success.fetch_add(1, Ordering::Relaxed);
                self.lifetime.observe(ms);
                self.window.observe(ms);
            }
        }
    }

    /// Drain the window horizon. Meant for a single reporter; concurrent
    /// `record` calls land in either this window or the next.
    pub fn snapshot_window(&self) -> WindowSnapshot {
        let failures = self.window_failure.swap(0, Ordering::Relaxed);
        let histogram = self.window.snapshot_and_reset();
        WindowSnapshot {
            failures,
            histogram,
        }
    }

    /// Read the lifetime horizon without modifying it.
    pub fn snapshot_total(&self) -> TotalSnapshot {
        TotalSnapshot {
            successes: self.lifetime_success.load(Ordering::Relaxed),
            failures: self.lifetime_failure.load(Ordering::Relaxed),
            histogram: self.lifetime.snapshot(),
        }
    }

    pub fn bounds(&self) -> &[f64] {
        self.lifetime.bounds()
    }

    pub fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.started_at_utc
    }

    /// Wall time since the aggregator was created.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[inline]
fn duration_to_ms(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

/// Successes per second; 0 when no time has elapsed.
pub fn throughput(successes: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs > 0.0 {
        successes as f64 / elapsed_secs
    } else {
        0.0
    }
}

/// Tail-latency figures derived from one histogram snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencyStats {
    pub fn from_snapshot(snapshot: &HistogramSnapshot) -> Self {
        Self {
            p95_ms: snapshot.quantile(0.95),
            p99_ms: snapshot.quantile(0.99),
            max_ms: snapshot.max_ms(),
        }
    }
}

/// Statistics emitted on every reporter tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalReport {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub elapsed_secs: f64,
    pub interval_ok: u64,
    pub interval_err: u64,
    pub interval: LatencyStats,
    pub total_ok: u64,
    pub total_err: u64,
    pub total_tps: f64,
    pub total: LatencyStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resident_memory_mb: Option<f64>,
}

impl IntervalReport {
    /// Drain the window, read the lifetime horizon, and derive the report.
    pub fn collect(metrics: &MetricsAggregator) -> Self {
        let window = metrics.snapshot_window();
        let total = metrics.snapshot_total();
        let elapsed_secs = metrics.elapsed().as_secs_f64();
        Self::from_snapshots(&window, &total, elapsed_secs)
    }

    pub fn from_snapshots(window: &WindowSnapshot, total: &TotalSnapshot, elapsed_secs: f64) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            elapsed_secs,
            interval_ok: window.successes(),
            interval_err: window.failures,
            interval: LatencyStats::from_snapshot(&window.histogram),
            total_ok: total.successes,
            total_err: total.failures,
            total_tps: throughput(total.successes, elapsed_secs),
            total: LatencyStats::from_snapshot(&total.histogram),
            resident_memory_mb: utils::resident_memory_bytes()
                .map(|b| b as f64 / (1024.0 * 1024.0)),
        }
    }

    pub fn log(&self) {
        info!(
            interval_ok = self.interval_ok,
            interval_err = self.interval_err,
            interval_p95_ms = self.interval.p95_ms,
            interval_p99_ms = self.interval.p99_ms,
            interval_max_ms = self.interval.max_ms,
            total_ok = self.total_ok,
            total_err = self.total_err,
            total_tps = self.total_tps,
            total_p95_ms = self.total.p95_ms,
            total_p99_ms = self.total.p99_ms,
            total_max_ms = self.total.max_ms,
            "{}",
            self
        );
    }
}

impl std::fmt::Display for IntervalReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] interval_ok={} interval_err={} interval_p95={:.2}ms interval_p99={:.2}ms \
             interval_max={:.2}ms total_ok={} total_err={} total_tps={:.2} total_p95={:.2}ms \
             total_p99={:.2}ms total_max={:.2}ms",
            self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            self.interval_ok,
            self.interval_err,
            self.interval.p95_ms,
            self.interval.p99_ms,
            self.interval.max_ms,
            self.total_ok,
            self.total_err,
            self.total_tps,
            self.total.p95_ms,
            self.total.p99_ms,
            self.total.max_ms,
        )?;
        if let Some(mb) = self.resident_memory_mb {
            write!(f, " mem_rss_mb={:.2}", mb)?;
        }
        Ok(())
    }
}

/// Exact percentiles computed from raw samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExactPercentiles {
    pub samples: usize,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// End-of-run read-out, always built from a non-destructive lifetime snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalSummary {
    pub ok: u64,
    pub err: u64,
    pub elapsed_secs: f64,
    pub tps: f64,
    pub error_rate: f64,
    pub mean_ms: f64,
    pub latency: LatencyStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exact: Option<ExactPercentiles>,
}

impl FinalSummary {
    pub fn from_total(total: &TotalSnapshot, elapsed_secs: f64) -> Self {
        let attempts = total.successes + total.failures;
        Self {
            ok: total.successes,
            err: total.failures,
            elapsed_secs,
            tps: throughput(total.successes, elapsed_secs),
            error_rate: if attempts > 0 {
                total.failures as f64 / attempts as f64
            } else {
                0.0
            },
            mean_ms: total.histogram.mean_ms(),
            latency: LatencyStats::from_snapshot(&total.histogram),
            exact: None,
        }
    }

    pub fn with_exact(mut self, exact: ExactPercentiles) -> Self {
        self.exact = Some(exact);
        self
    }
}

impl std::fmt::Display for FinalSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Final summary: ok={} err={} elapsed={:.2}s tps={:.2} p95={:.2}ms p99={:.2}ms max={:.2}ms",
            self.ok,
            self.err,
            self.elapsed_secs,
            self.tps,
            self.latency.p95_ms,
            self.latency.p99_ms,
            self.latency.max_ms,
        )?;
        if let Some(exact) = self.exact {
            write!(
                f,
                " exact_p50={:.3}ms exact_p95={:.3}ms exact_p99={:.3}ms",
                exact.p50_ms, exact.p95_ms, exact.p99_ms
            )?;
        }
        Ok(())
    }
}
