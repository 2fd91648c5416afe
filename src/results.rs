//! # Results Output
//!
//! Two file outputs, both optional:
//!
//! - [`ReportStream`] appends every [`IntervalReport`] to a JSON array while
//!   the run is in progress, so partial results survive an aborted run.
//! - [`ResultsManager`] writes one pretty-printed [`BenchmarkResults`]
//!   document when the run ends.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::benchmark::BenchmarkConfig;
use crate::metrics::{FinalSummary, IntervalReport};
use crate::worker::WorkerStats;

/// Complete record of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResults {
    pub metadata: RunMetadata,
    pub configuration: BenchmarkConfig,
    pub summary: FinalSummary,
    /// Empty unless the runner was asked to keep interval history.
    pub intervals: Vec<IntervalReport>,
    pub workers: Vec<WorkerStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: String,
    pub run_id: String,
    pub backend: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub system_info: SystemInfo,
}

impl RunMetadata {
    pub fn new(backend: &str, started_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            version: crate::VERSION.to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            backend: backend.to_string(),
            started_at,
            finished_at: chrono::Utc::now(),
            system_info: SystemInfo::default(),
        }
    }
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub rust_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: crate::utils::get_cpu_cores(),
            rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
        }
    }
}

/// Writes the final results document.
pub struct ResultsManager {
    output_file: PathBuf,
}

impl ResultsManager {
    pub fn new(output_file: &Path) -> Self {
        Self {
            output_file: output_file.to_path_buf(),
        }
    }

    pub fn output_file(&self) -> &Path {
        &self.output_file
    }

    /// Serialize `results` and write them, replacing any existing file.
    pub fn finalize(&self, results: &BenchmarkResults) -> Result<()> {
        let json = serde_json::to_string_pretty(results).context("Failed to serialize results")?;
        std::fs::write(&self.output_file, json)
            .with_context(|| format!("Failed to write results to {:?}", self.output_file))?;
        info!("Results written to: {:?}", self.output_file);
        Ok(())
    }
}

/// Incrementally written JSON array of interval reports.
///
/// The file is valid JSON only after [`ReportStream::finish`]; until then it
/// is missing the closing bracket.
pub struct ReportStream {
    path: PathBuf,
    writer: BufWriter<Box<dyn Write + Send>>,
    written: usize,
}

impl ReportStream {
    /// Create (or truncate) `path` and write the array opening.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create streaming file {:?}", path))?;
        Self::from_writer(path, file)
    }

    /// Stream into an arbitrary writer; `path` is only used in messages.
    pub fn from_writer<W>(path: &Path, writer: W) -> Result<Self>
    where
        W: Write + Send + 'static,
    {
        let mut writer: BufWriter<Box<dyn Write + Send>> = BufWriter::new(Box::new(writer));
        writeln!(writer, "[")?;
        writer
            .flush()
            .with_context(|| format!("Failed to flush {:?}", path))?;
        debug!("Enabled streaming to: {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Append one report and flush it to disk.
    pub fn append(&mut self, report: &IntervalReport) -> Result<()> {
        if self.written > 0 {
            writeln!(self.writer, ",")?;
        }
        let json = serde_json::to_string_pretty(report)?;
        write!(self.writer, "{}", json)?;
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush {:?}", self.path))?;
        self.written += 1;
        Ok(())
    }

    /// Close the array.
    pub fn finish(mut self) -> Result<()> {
        writeln!(self.writer, "\n]")?;
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush {:?}", self.path))?;
        debug!("Closed streaming file {:?} with {} reports", self.path, self.written);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::DEFAULT_BOUNDS_MS;
    use crate::metrics::{MetricsAggregator, Outcome};
    use std::time::Duration;

    fn sample_report(ok: u32) -> IntervalReport {
        let m = MetricsAggregator::new(&DEFAULT_BOUNDS_MS).unwrap();
        for _ in 0..ok {
            m.record(Outcome::Success(Duration::from_millis(2)));
        }
        IntervalReport::collect(&m)
    }

    #[test]
    fn test_empty_stream_is_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.json");
        let stream = ReportStream::create(&path).unwrap();
        assert!(stream.is_empty());
        stream.finish().unwrap();

        let parsed: Vec<IntervalReport> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_stream_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.json");
        let mut stream = ReportStream::create(&path).unwrap();
        for ok in [1, 2, 3] {
            stream.append(&sample_report(ok)).unwrap();
        }
        assert_eq!(stream.len(), 3);
        stream.finish().unwrap();

        let parsed: Vec<IntervalReport> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let counts: Vec<u64> = parsed.iter().map(|r| r.interval_ok).collect();
        assert_eq!(counts, vec![1, 2, 3]);
    }

    #[test]
    fn test_create_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("stream.json");
        assert!(ReportStream::create(&path).is_err());
    }

    #[test]
    fn test_system_info_default() {
        let info = SystemInfo::default();

        assert!(!info.os.is_empty());
        assert!(!info.architecture.is_empty());
        assert!(info.cpu_cores > 0);
    }

    #[test]
    fn test_run_metadata_ids_are_unique() {
        let now = chrono::Utc::now();
        let a = RunMetadata::new("synthetic", now);
        let b = RunMetadata::new("synthetic", now);
        assert_ne!(a.run_id, b.run_id);
        assert_eq!(a.version, crate::VERSION);
        assert!(a.finished_at >= a.started_at);
    }
}
