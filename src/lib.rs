//! # Loadbench Library
//!
//! A load-generation harness that drives a backend with a fixed number of
//! concurrent workers and reports live latency percentiles and throughput.
//!
//! ## Architecture Overview
//!
//! The library is organized into several key modules:
//!
//! - `histogram`: Lock-free fixed-bucket latency histogram
//! - `quantile`: Quantile estimation from bucket snapshots, plus exact sample quantiles
//! - `metrics`: Dual-horizon (lifetime + window) aggregator and derived reports
//! - `backend`: Unit-of-work abstraction with synthetic and TCP echo backends
//! - `worker`: Worker pool executing units of work until cancelled
//! - `reporter`: Periodic interval reporting
//! - `exporter`: Prometheus text exposition and HTTP endpoint
//! - `benchmark`: Run configuration and lifecycle orchestration
//! - `results`: JSON results document and streamed interval reports
//! - `cli`, `logging`, `utils`: Command-line, tracing setup and helpers
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use loadbench::backend::{BackendConfig, SyntheticConfig};
//! use loadbench::{BenchmarkConfig, BenchmarkRunner};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BenchmarkConfig {
//!         concurrency: 16,
//!         duration: Duration::from_secs(10),
//!         report_interval: Duration::from_secs(1),
//!         bucket_bounds: loadbench::histogram::DEFAULT_BOUNDS_MS.to_vec(),
//!         backend: BackendConfig::Synthetic(SyntheticConfig::default()),
//!         exact_quantiles: false,
//!         prometheus: None,
//!         warmup_timeout: Duration::from_secs(10),
//!     };
//!
//!     let mut runner = BenchmarkRunner::new(config)?;
//!     let results = runner.run().await?;
//!
//!     println!("p99: {:.3}ms", results.summary.latency.p99_ms);
//!     Ok(())
//! }
//! ```
//!
//! ## Performance Characteristics
//!
//! - **No locks on the hot path**: recording is a handful of relaxed atomic
//!   operations on cache-padded counters
//! - **Bounded memory**: histograms have a fixed bucket count regardless of
//!   sample volume (unless exact quantiles are requested)
//! - **Async I/O** throughout using Tokio

/// Unit-of-work backends
///
/// Defines the `Backend` and `Session` traits that the worker pool drives,
/// the typed `BackendError`, and the built-in synthetic and TCP backends.
pub mod backend;

/// Run configuration and lifecycle orchestration
///
/// Contains `BenchmarkConfig`, `BenchmarkRunner` and the run `Phase` state
/// machine.
pub mod benchmark;

/// Command-line interface
///
/// Argument parsing with clap, including human-readable durations
/// (e.g., "250ms", "10s", "5m").
pub mod cli;

pub mod exporter;

/// Lock-free latency histogram
pub mod histogram;

pub mod logging;

/// Dual-horizon metrics aggregation
///
/// The `MetricsAggregator` every worker records into, and the interval and
/// final reports derived from its snapshots.
pub mod metrics;

pub mod quantile;

pub mod reporter;

/// Result documents and output management
pub mod results;

pub mod utils;

pub mod worker;

// Re-export key types for convenient library usage

/// Main benchmark execution engine
pub use benchmark::{BenchmarkConfig, BenchmarkRunner, Phase};

pub use cli::Args;

/// Core unit-of-work abstractions
pub use backend::{Backend, BackendError, Session};

/// Metrics types
pub use metrics::{FinalSummary, IntervalReport, MetricsAggregator, Outcome};

pub use histogram::{Histogram, HistogramSnapshot};

/// Result collection and management
pub use results::{BenchmarkResults, ResultsManager};

/// The current version of loadbench
///
/// Populated from Cargo.toml and recorded in every results document.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// Durations are kept as strings where they feed clap `default_value`
/// attributes, so `--help` shows them the way users type them.
pub mod defaults {
    use std::time::Duration;

    /// Default number of concurrent workers
    pub const CONCURRENCY: usize = 16;

    /// Default run duration
    pub const DURATION: &str = "30s";

    /// Default interval between progress reports
    pub const REPORT_INTERVAL: &str = "5s";

    /// Default TCP payload size in bytes
    pub const PAYLOAD_SIZE: usize = 64;

    /// Default bound on one TCP unit of work
    pub const IO_TIMEOUT: &str = "5s";

    /// Default HTTP path for Prometheus metrics
    pub const PROMETHEUS_PATH: &str = "/metrics";

    /// Lower bound on the warm-up probe timeout
    ///
    /// The probe may be the first connect to a cold service, so it gets more
    /// room than a steady-state unit of work.
    pub const WARMUP_TIMEOUT: Duration = Duration::from_secs(10);
}
