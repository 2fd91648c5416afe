//! # Utility Functions and Helper Module
//!
//! Small helpers shared by the reporting, export, and configuration code.
//!
//! ## Key Functionality Categories
//!
//! - **Formatting**: human-readable latencies, rates, and byte counts, plus the
//!   shortest-form float rendering used in Prometheus labels
//! - **Validation**: input parameter checks with clear error messages
//! - **System Information**: CPU count and process resident memory
//!
//! ## Usage Examples
//!
//! ```rust
//! use loadbench::utils::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! assert_eq!(format_latency_ms(0.0015), "1.50μs");
//! assert_eq!(format_latency_ms(2.5), "2.50ms");
//! assert_eq!(trim_float(0.25), "0.25");
//! assert_eq!(trim_float(1000.0), "1000");
//!
//! validate_concurrency(16)?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;

/// Upper limit accepted for `--concurrency`.
pub const MAX_CONCURRENCY: usize = 4096;

/// Format a millisecond latency with a unit that keeps it readable.
///
/// - below 1µs: nanoseconds, whole numbers (e.g. "500ns")
/// - below 1ms: microseconds, two decimals (e.g. "1.50μs")
/// - below 1s: milliseconds, two decimals (e.g. "25.75ms")
/// - otherwise: seconds, two decimals (e.g. "1.25s")
///
/// ```rust
/// # use loadbench::utils::format_latency_ms;
/// assert_eq!(format_latency_ms(0.0005), "500ns");
/// assert_eq!(format_latency_ms(1250.0), "1.25s");
/// ```
pub fn format_latency_ms(ms: f64) -> String {
    let ns = ms * 1_000_000.0;
    if ns < 1_000.0 {
        format!("{:.0}ns", ns)
    } else if ns < 1_000_000.0 {
        format!("{:.2}μs", ns / 1_000.0)
    } else if ms < 1_000.0 {
        format!("{:.2}ms", ms)
    } else {
        format!("{:.2}s", ms / 1_000.0)
    }
}

/// Format a unit-of-work rate using decimal scaling.
///
/// ```rust
/// # use loadbench::utils::format_ops_rate;
/// assert_eq!(format_ops_rate(750.0), "750 ops/s");
/// assert_eq!(format_ops_rate(15500.0), "15.50K ops/s");
/// assert_eq!(format_ops_rate(2300000.0), "2.30M ops/s");
/// ```
pub fn format_ops_rate(ops_per_second: f64) -> String {
    if ops_per_second < 1000.0 {
        format!("{:.0} ops/s", ops_per_second)
    } else if ops_per_second < 1_000_000.0 {
        format!("{:.2}K ops/s", ops_per_second / 1000.0)
    } else {
        format!("{:.2}M ops/s", ops_per_second / 1_000_000.0)
    }
}

/// Format a byte count with binary (1024-based) units.
pub fn format_bytes(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{:.0} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Shortest decimal rendering of `value` that round-trips.
///
/// Whole numbers print without a decimal point, matching how Prometheus
/// `le` labels are usually written (`le="1000"`, `le="0.25"`).
pub fn trim_float(value: f64) -> String {
    if value.is_infinite() {
        return if value > 0.0 { "+Inf".into() } else { "-Inf".into() };
    }
    if value.is_nan() {
        return "NaN".into();
    }
    format!("{}", value)
}

/// Validate that concurrency level is reasonable
///
/// ## Validation Rules
///
/// - **Minimum**: 1 worker
/// - **Maximum**: [`MAX_CONCURRENCY`] workers
pub fn validate_concurrency(concurrency: usize) -> Result<()> {
    if concurrency == 0 {
        anyhow::bail!("Concurrency cannot be zero");
    }
    if concurrency > MAX_CONCURRENCY {
        anyhow::bail!(
            "Concurrency {} is too high (maximum {})",
            concurrency,
            MAX_CONCURRENCY
        );
    }
    Ok(())
}

/// Number of logical CPU cores available to the process.
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}

/// Resident set size of the current process in bytes.
///
/// Read from `/proc/self/statm` (second field, in pages). Returns `None` on
/// platforms without procfs or if the file cannot be parsed; memory figures
/// are informational and never fail a run.
#[cfg(target_os = "linux")]
pub fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    // SAFETY: sysconf has no preconditions and only reads system configuration.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(resident_pages * page_size as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn resident_memory_bytes() -> Option<u64> {
    None
}
