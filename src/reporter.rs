//! # Periodic Reporter
//!
//! A single task that wakes on a fixed interval, drains the window horizon,
//! reads the lifetime horizon, and emits an [`IntervalReport`]. Ticks are
//! scheduled from the reporter's own start time, not from work completion,
//! so slow units of work do not shift the reporting cadence. A tick that is
//! missed because the runtime was busy is skipped rather than fired in a
//! burst.
//!
//! Reports are logged (and optionally streamed) as they are produced. They
//! are only retained in memory when [`Reporter::with_history`] asks for it,
//! so a long run without a results file holds no per-interval state.
//!
//! The reporter is the only caller of
//! [`MetricsAggregator::snapshot_window`], so window drains never race each
//! other.

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::metrics::{IntervalReport, MetricsAggregator};
use crate::results::ReportStream;

pub struct Reporter {
    metrics: Arc<MetricsAggregator>,
    interval: Duration,
    stream: Option<ReportStream>,
    keep_history: bool,
}

impl Reporter {
    /// Fails if `interval` is zero.
    pub fn new(metrics: Arc<MetricsAggregator>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            bail!("Report interval must be greater than zero");
        }
        Ok(Self {
            metrics,
            interval,
            stream: None,
            keep_history: false,
        })
    }

    /// Also append every report to `stream` as it is produced.
    pub fn with_stream(mut self, stream: ReportStream) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Retain every report and return them from [`Reporter::run`].
    pub fn with_history(mut self) -> Self {
        self.keep_history = true;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Tick until `shutdown` turns `true` (or its sender is dropped).
    ///
    /// Returns every report emitted when history is enabled, otherwise an
    /// empty Vec. Stream failures, the final close included, are logged as
    /// warnings and never end the run.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Vec<IntervalReport> {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reports = Vec::new();
        let mut emitted = 0usize;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let report = IntervalReport::collect(&self.metrics);
            report.log();
            if let Some(stream) = self.stream.as_mut() {
                if let Err(e) = stream.append(&report) {
                    warn!("Disabling interval report streaming: {:#}", e);
                    self.stream = None;
                }
            }
            emitted += 1;
            if self.keep_history {
                reports.push(report);
            }
        }

        debug!("Reporter stopped after {} reports", emitted);
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.finish() {
                warn!("Failed to close interval report stream: {:#}", e);
            }
        }
        reports
    }
}
