//! # Benchmark Engine Module
//!
//! This module owns one complete load-generation run: it validates the
//! configuration, probes the backend, starts the worker pool, the reporter
//! and the optional Prometheus endpoint, waits for the run to end, and builds
//! the final summary.
//!
//! ## Key Components
//!
//! - **BenchmarkConfig**: Validated run parameters, built from CLI arguments
//! - **BenchmarkRunner**: Orchestrator that drives the run lifecycle
//! - **Phase**: Observable state of the lifecycle
//!
//! ## Run Lifecycle
//!
//! 1. **Idle**: Runner constructed, nothing started
//! 2. **WarmingUp**: One probe unit of work on a fresh session. If it fails
//!    the run is aborted before any worker exists
//! 3. **Running**: Workers and reporter active until the duration timer fires
//!    or the stop signal (Ctrl-C for [`BenchmarkRunner::run`]) arrives
//! 4. **Draining**: Shutdown signalled, in-flight units of work are dropped and
//!    every task is joined
//! 5. **Terminal**: Final summary taken from one non-destructive lifetime
//!    snapshot after all workers have exited
//!
//! Terminal is entered exactly once per runner, on success and on failure.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::{
    backend::{Backend, BackendConfig, BackendError, BackendFactory, SyntheticConfig, TcpConfig},
    cli::{Args, BackendKind},
    exporter::PrometheusServer,
    histogram::validate_bounds,
    metrics::{ExactPercentiles, FinalSummary, MetricsAggregator},
    quantile::SampleRecorder,
    reporter::Reporter,
    results::{BenchmarkResults, ReportStream, RunMetadata},
    utils::{format_latency_ms, format_ops_rate, validate_concurrency},
    worker::WorkerPool,
};

/// A helper struct to provide a consistent, single source of truth for displaying
/// the run configuration.
struct BenchmarkConfigDisplay<'a> {
    config: &'a BenchmarkConfig,
}

impl std::fmt::Display for BenchmarkConfigDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let config = self.config;
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Starting Benchmark for: {}", config.backend)?;
        writeln!(f, "  Concurrency:        {}", config.concurrency)?;
        writeln!(f, "  Test Duration:      {:?}", config.duration)?;
        writeln!(f, "  Report Interval:    {:?}", config.report_interval)?;
        writeln!(f, "  Bucket Count:       {}", config.bucket_bounds.len() + 1)?;
        let exact = if config.exact_quantiles {
            "Enabled"
        } else {
            "Disabled (default)"
        };
        writeln!(f, "  Exact Quantiles:    {}", exact)?;
        match &config.prometheus {
            Some(prometheus) => writeln!(
                f,
                "  Prometheus:         {}{}",
                prometheus.listen, prometheus.path
            )?,
            None => writeln!(f, "  Prometheus:         Not set")?,
        }
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// Where to serve Prometheus metrics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrometheusConfig {
    pub listen: SocketAddr,
    pub path: String,
}

/// Configuration for benchmark execution
///
/// This structure is the authoritative, validated description of a run. It
/// is built from command-line arguments by [`BenchmarkConfig::from_args`] or
/// assembled directly by library users, and is recorded verbatim in the
/// results document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Number of concurrent workers
    ///
    /// Each worker runs units of work back to back, so this is also the
    /// number of units of work in flight at any moment.
    pub concurrency: usize,

    /// How long workers run before shutdown is signalled
    pub duration: Duration,

    /// Time between interval reports
    ///
    /// Each report drains the window horizon, so this is also the length of
    /// the window the interval percentiles describe.
    pub report_interval: Duration,

    /// Latency histogram bucket upper bounds in milliseconds
    ///
    /// Must be strictly increasing, positive and finite. An overflow bucket
    /// for values above the last bound is always added.
    pub bucket_bounds: Vec<f64>,

    /// Which backend executes each unit of work, and how
    pub backend: BackendConfig,

    /// Keep every latency sample to compute exact final percentiles
    ///
    /// Memory grows linearly with the number of successful units of work.
    pub exact_quantiles: bool,

    /// Optional Prometheus HTTP endpoint
    pub prometheus: Option<PrometheusConfig>,

    /// Upper bound on the warm-up probe, session open included
    pub warmup_timeout: Duration,
}

impl BenchmarkConfig {
    /// Build and validate a configuration from parsed arguments.
    pub fn from_args(args: &Args) -> Result<Self> {
        let backend = match args.backend {
            BackendKind::Synthetic => BackendConfig::Synthetic(SyntheticConfig {
                latency: args.synthetic_latency,
                jitter: args.synthetic_jitter,
                failure_rate: args.synthetic_failure_rate,
            }),
            BackendKind::Tcp => BackendConfig::Tcp(TcpConfig {
                target: args
                    .target
                    .clone()
                    .context("--target is required for the tcp backend")?,
                payload_size: args.payload_size,
                io_timeout: args.io_timeout,
                connection_mode: args.connection_mode,
            }),
        };

        let prometheus = args.prometheus_listen.map(|listen| PrometheusConfig {
            listen,
            path: args.prometheus_path.clone(),
        });

        let config = Self {
            concurrency: args.concurrency,
            duration: args.duration,
            report_interval: args.report_interval,
            bucket_bounds: args.bucket_bounds.clone(),
            backend,
            exact_quantiles: args.exact_quantiles,
            prometheus,
            warmup_timeout: warmup_timeout_for(args.io_timeout),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run.
    pub fn validate(&self) -> Result<()> {
        validate_concurrency(self.concurrency)?;
        if self.duration.is_zero() {
            bail!("Duration must be greater than zero");
        }
        if self.report_interval.is_zero() {
            bail!("Report interval must be greater than zero");
        }
        if self.warmup_timeout.is_zero() {
            bail!("Warm-up timeout must be greater than zero");
        }
        validate_bounds(&self.bucket_bounds).context("Invalid --bucket-bounds")?;
        self.backend.validate()?;
        if let Some(prometheus) = &self.prometheus {
            if !prometheus.path.starts_with('/') {
                bail!(
                    "Prometheus path must start with '/', got {:?}",
                    prometheus.path
                );
            }
        }
        Ok(())
    }
}

/// The probe gets twice the per-unit I/O budget, never less than the default.
fn warmup_timeout_for(io_timeout: Duration) -> Duration {
    io_timeout.saturating_mul(2).max(crate::defaults::WARMUP_TIMEOUT)
}

/// Lifecycle state of a [`BenchmarkRunner`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Idle,
    WarmingUp,
    Running,
    Draining,
    Terminal,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::WarmingUp => write!(f, "warming-up"),
            Phase::Running => write!(f, "running"),
            Phase::Draining => write!(f, "draining"),
            Phase::Terminal => write!(f, "terminal"),
        }
    }
}

/// Benchmark runner that orchestrates a run
///
/// A runner executes at most one run. Its [`Phase`] can be observed through
/// [`BenchmarkRunner::phase`] or, from other tasks, through the receiver
/// returned by [`BenchmarkRunner::subscribe`].
pub struct BenchmarkRunner {
    config: BenchmarkConfig,
    backend: Arc<dyn Backend>,
    report_stream: Option<ReportStream>,
    keep_history: bool,
    phase: watch::Sender<Phase>,
}

impl BenchmarkRunner {
    /// Create a runner using the backend described by `config`.
    pub fn new(config: BenchmarkConfig) -> Result<Self> {
        config.validate()?;
        let backend = BackendFactory::create(&config.backend)?;
        Ok(Self::with_backend(config, backend))
    }

    /// Create a runner around a caller-provided backend.
    ///
    /// `config.backend` is only used for display and the results document.
    pub fn with_backend(config: BenchmarkConfig, backend: Arc<dyn Backend>) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            config,
            backend,
            report_stream: None,
            keep_history: false,
            phase,
        }
    }

    /// Stream every interval report into `stream` while running.
    pub fn with_report_stream(mut self, stream: ReportStream) -> Self {
        self.report_stream = Some(stream);
        self
    }

    /// Keep every interval report and return them in
    /// [`BenchmarkResults::intervals`]. Off by default, in which case the
    /// reports are only logged (and streamed, if a stream is set).
    pub fn with_interval_history(mut self) -> Self {
        self.keep_history = true;
        self
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        debug!("Phase transition: {} -> {}", previous, phase);
    }

    /// Run for the configured duration, stopping early on Ctrl-C.
    pub async fn run(&mut self) -> Result<BenchmarkResults> {
        self.run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupt received, stopping early"),
                Err(e) => {
                    warn!("Cannot listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await
                }
            }
        })
        .await
    }

    /// Run for the configured duration, stopping early when `stop` completes.
    pub async fn run_until<F>(&mut self, stop: F) -> Result<BenchmarkResults>
    where
        F: Future<Output = ()>,
    {
        if self.phase() != Phase::Idle {
            bail!("Benchmark runner has already been used");
        }
        info!(
            "{}",
            BenchmarkConfigDisplay {
                config: &self.config
            }
        );
        if self.config.report_interval > self.config.duration {
            warn!(
                "Report interval {:?} is longer than the run duration {:?}; no interval reports will be produced",
                self.config.report_interval, self.config.duration
            );
        }

        let result = self.execute(stop).await;
        self.enter(Phase::Terminal);
        result
    }

    async fn execute<F>(&mut self, stop: F) -> Result<BenchmarkResults>
    where
        F: Future<Output = ()>,
    {
        self.enter(Phase::WarmingUp);
        let probe = self
            .run_warmup()
            .await
            .with_context(|| format!("Warm-up against {} failed", self.config.backend))?;
        info!("Warm-up completed in {}", format_latency_ms(probe.as_secs_f64() * 1000.0));

        let metrics = Arc::new(MetricsAggregator::new(&self.config.bucket_bounds)?);
        let samples = self
            .config
            .exact_quantiles
            .then(|| Arc::new(SampleRecorder::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let exporter = match &self.config.prometheus {
            Some(prometheus) => {
                let server = PrometheusServer::bind(
                    prometheus.listen,
                    &prometheus.path,
                    Arc::clone(&metrics),
                )
                .await?;
                Some(tokio::spawn(server.run(shutdown_rx.clone())))
            }
            None => None,
        };

        let mut reporter = Reporter::new(Arc::clone(&metrics), self.config.report_interval)?;
        if let Some(stream) = self.report_stream.take() {
            reporter = reporter.with_stream(stream);
        }
        if self.keep_history {
            reporter = reporter.with_history();
        }
        let pool = WorkerPool::spawn(
            self.config.concurrency,
            Arc::clone(&self.backend),
            Arc::clone(&metrics),
            samples.clone(),
            shutdown_rx.clone(),
        )?;
        let reporter = tokio::spawn(reporter.run(shutdown_rx));

        self.enter(Phase::Running);
        info!(
            "Running {} workers against {} for {:?}",
            pool.len(),
            self.backend.name(),
            self.config.duration
        );
        tokio::select! {
            _ = sleep(self.config.duration) => info!("Test duration elapsed"),
            _ = stop => info!("Stop requested"),
        }

        self.enter(Phase::Draining);
        shutdown_tx.send_replace(true);
        let workers = pool.join().await?;
        let intervals = reporter.await.context("Reporter task panicked")?;
        if let Some(exporter) = exporter {
            if let Err(e) = exporter.await.context("Prometheus task panicked")? {
                warn!("Prometheus endpoint failed: {:#}", e);
            }
        }

        // Every worker has been joined, so this snapshot is final.
        let elapsed = metrics.elapsed();
        let total = metrics.snapshot_total();
        let mut summary = FinalSummary::from_total(&total, elapsed.as_secs_f64());
        if let Some(samples) = samples {
            let exact = samples.quantiles(&[0.50, 0.95, 0.99]);
            summary = summary.with_exact(ExactPercentiles {
                samples: samples.len(),
                p50_ms: exact[0],
                p95_ms: exact[1],
                p99_ms: exact[2],
            });
        }
        info!(
            ok = summary.ok,
            err = summary.err,
            tps = summary.tps,
            p95_ms = summary.latency.p95_ms,
            p99_ms = summary.latency.p99_ms,
            max_ms = summary.latency.max_ms,
            "{}",
            summary
        );
        info!(
            "Throughput: {}, mean latency {}",
            format_ops_rate(summary.tps),
            format_latency_ms(summary.mean_ms)
        );

        Ok(BenchmarkResults {
            metadata: RunMetadata::new(self.backend.name(), metrics.started_at()),
            configuration: self.config.clone(),
            summary,
            intervals,
            workers,
        })
    }

    /// Open one session and run a single unit of work on it.
    ///
    /// Returns the probe's latency. Nothing is recorded.
    async fn run_warmup(&self) -> Result<Duration> {
        match timeout(self.config.warmup_timeout, probe(self.backend.as_ref())).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(BackendError::Timeout(self.config.warmup_timeout).into()),
        }
    }
}

async fn probe(backend: &dyn Backend) -> Result<Duration, BackendError> {
    let mut session = backend.open_session().await?;
    let start = Instant::now();
    let result = session.execute().await;
    let elapsed = start.elapsed();
    session.close().await;
    result.map(|()| elapsed)
}
