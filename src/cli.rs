use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::ConnectionMode;
use crate::histogram::DEFAULT_BOUNDS_MS;

/// Loadbench - drive a backend under fixed concurrency and report live latency percentiles
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Number of concurrent workers
    #[clap(short = 'c', long, default_value_t = crate::defaults::CONCURRENCY, help_heading = "Core Options")]
    pub concurrency: usize,

    /// How long to run (e.g. 30s, 5m, 1.5h; a bare number means seconds)
    #[clap(short = 'd', long, value_parser = parse_duration, default_value = crate::defaults::DURATION, help_heading = "Core Options")]
    pub duration: Duration,

    /// Interval between progress reports
    #[clap(short = 'r', long, value_parser = parse_duration, default_value = crate::defaults::REPORT_INTERVAL, help_heading = "Core Options")]
    pub report_interval: Duration,

    /// Backend that executes each unit of work
    #[clap(short = 'b', long, value_enum, default_value_t = BackendKind::Synthetic, help_heading = "Core Options")]
    pub backend: BackendKind,

    /// Keep one connection per worker, or open one per unit of work
    #[clap(long, value_enum, default_value_t = ConnectionMode::LongRunning, help_heading = "Core Options")]
    pub connection_mode: ConnectionMode,

    /// Base latency of a synthetic unit of work
    #[clap(long, value_parser = parse_duration, default_value = "1ms", help_heading = "Synthetic Backend")]
    pub synthetic_latency: Duration,

    /// Uniform jitter applied to the synthetic latency (±)
    #[clap(long, value_parser = parse_duration, default_value = "0ms", help_heading = "Synthetic Backend")]
    pub synthetic_jitter: Duration,

    /// Probability (0.0 to 1.0) that a synthetic unit of work fails
    #[clap(long, default_value_t = 0.0, help_heading = "Synthetic Backend")]
    pub synthetic_failure_rate: f64,

    /// Echo server address (host:port) for the TCP backend
    #[clap(long, help_heading = "TCP Backend")]
    pub target: Option<String>,

    /// Bytes sent and expected back per unit of work
    #[clap(long, default_value_t = crate::defaults::PAYLOAD_SIZE, help_heading = "TCP Backend")]
    pub payload_size: usize,

    /// Upper bound on one TCP unit of work, connect included
    #[clap(long, value_parser = parse_duration, default_value = crate::defaults::IO_TIMEOUT, help_heading = "TCP Backend")]
    pub io_timeout: Duration,

    /// Latency bucket upper bounds in milliseconds, comma-separated
    #[clap(long, value_delimiter = ',', default_values_t = DEFAULT_BOUNDS_MS.to_vec(), help_heading = "Metrics")]
    pub bucket_bounds: Vec<f64>,

    /// Also compute exact final percentiles from raw samples (O(n) memory)
    #[clap(long, default_value_t = false, help_heading = "Metrics")]
    pub exact_quantiles: bool,

    /// Serve Prometheus metrics on this address (e.g. 0.0.0.0:9100)
    #[clap(long, help_heading = "Metrics")]
    pub prometheus_listen: Option<SocketAddr>,

    /// HTTP path for Prometheus metrics
    #[clap(long, default_value = crate::defaults::PROMETHEUS_PATH, help_heading = "Metrics")]
    pub prometheus_path: String,

    /// Output file for results (JSON format)
    #[clap(short = 'o', long, help_heading = "Output")]
    pub output_file: Option<PathBuf>,

    /// JSON output file for streaming interval reports during execution
    #[clap(long, help_heading = "Output")]
    pub streaming_output: Option<PathBuf>,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false, help_heading = "Output")]
    pub verbose: bool,

    /// Also write logs (without colours) to this file
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,
}

/// Available backends
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum BackendKind {
    /// In-process simulated work
    #[clap(name = "synthetic")]
    Synthetic,

    /// TCP echo round trips
    #[clap(name = "tcp")]
    Tcp,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Synthetic => write!(f, "synthetic"),
            BackendKind::Tcp => write!(f, "tcp"),
        }
    }
}

/// Parse duration from string (e.g., "250ms", "10s", "1.5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, scale) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, 0.001)
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, 1.0)
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, 60.0)
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, 3600.0)
    } else {
        (s, 1.0) // Default to seconds
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

    if num < 0.0 {
        return Err(format!("Duration cannot be negative: {}", s));
    }

    Duration::try_from_secs_f64(num * scale).map_err(|e| format!("Invalid duration {}: {}", s, e))
}
