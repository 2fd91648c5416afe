//! # Worker Pool
//!
//! N independent tokio tasks, each looping over: check cancellation, run one
//! unit of work, time it, record the outcome. Workers share nothing but the
//! [`MetricsAggregator`] (and the optional [`SampleRecorder`]).
//!
//! Cancellation is a `watch` channel where `true` means stop. Each in-flight
//! unit of work races the signal inside a `select!`, so a slow call is
//! dropped as soon as the run is cancelled instead of being waited out. A
//! cancelled unit of work is not recorded.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{Backend, Session};
use crate::metrics::{MetricsAggregator, Outcome};
use crate::quantile::SampleRecorder;

/// Per-worker tallies returned by [`WorkerPool::join`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub successes: u64,
    pub failures: u64,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<WorkerStats>>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers on the current tokio runtime.
    ///
    /// Fails if `concurrency` is zero.
    pub fn spawn(
        concurrency: usize,
        backend: Arc<dyn Backend>,
        metrics: Arc<MetricsAggregator>,
        samples: Option<Arc<SampleRecorder>>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        if concurrency == 0 {
            bail!("Worker pool needs at least one worker");
        }

        let handles = (0..concurrency)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(&backend),
                    Arc::clone(&metrics),
                    samples.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        debug!("Spawned {} workers on backend '{}'", concurrency, backend.name());
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit.
    ///
    /// Once this returns, no worker can write to the aggregator again, so a
    /// lifetime snapshot taken afterwards is final.
    pub async fn join(self) -> Result<Vec<WorkerStats>> {
        let mut stats = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            stats.push(handle.await.context("Worker task panicked")?);
        }
        Ok(stats)
    }
}

async fn run_worker(
    worker_id: usize,
    backend: Arc<dyn Backend>,
    metrics: Arc<MetricsAggregator>,
    samples: Option<Arc<SampleRecorder>>,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerStats {
    let mut stats = WorkerStats {
        worker_id,
        ..Default::default()
    };
    let mut session: Option<Box<dyn Session>> = None;
    // Consecutive open failures; only the first of an outage is a warning.
    let mut open_failures = 0u64;

    loop {
        if *shutdown.borrow() {
            break;
        }

        if session.is_none() {
            let opened = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                opened = backend.open_session() => opened,
            };
            match opened {
                Ok(s) => {
                    if open_failures > 0 {
                        info!(
                            "Worker {} opened session after {} failed attempts",
                            worker_id, open_failures
                        );
                        open_failures = 0;
                    }
                    session = Some(s);
                }
                Err(e) => {
                    if open_failures == 0 {
                        warn!("Worker {} failed to open session: {}", worker_id, e);
                    } else {
                        debug!("Worker {} failed to open session: {}", worker_id, e);
                    }
                    open_failures += 1;
                    metrics.record(Outcome::Failure);
                    stats.failures += 1;
                    tokio::task::yield_now().await;
                    continue;
                }
            }
        }
        let Some(current) = session.as_mut() else {
            continue;
        };

        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = current.execute() => result,
        };
        let outcome = Outcome::from_result(start.elapsed(), &result);

        match outcome {
            Outcome::Success(latency) => {
                stats.successes += 1;
                if let Some(samples) = &samples {
                    samples.record(latency.as_nanos() as f64 / 1_000_000.0);
                }
            }
            Outcome::Failure => stats.failures += 1,
        }
        metrics.record(outcome);
    }

    if let Some(mut session) = session {
        session.close().await;
    }
    debug!(
        "Worker {} stopped: ok={} err={}",
        worker_id, stats.successes, stats.failures
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::histogram::DEFAULT_BOUNDS_MS;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Backend whose units of work never complete.
    struct Stuck;

    struct StuckSession;

    #[async_trait]
    impl Session for StuckSession {
        async fn execute(&mut self) -> Result<(), BackendError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[async_trait]
    impl Backend for Stuck {
        fn name(&self) -> &'static str {
            "stuck"
        }

        async fn open_session(&self) -> Result<Box<dyn Session>, BackendError> {
            Ok(Box::new(StuckSession))
        }
    }

    /// Backend that alternates success and failure, counting opened sessions.
    struct Alternating {
        opened: AtomicUsize,
    }

    struct AlternatingSession {
        calls: u64,
    }

    #[async_trait]
    impl Session for AlternatingSession {
        async fn execute(&mut self) -> Result<(), BackendError> {
            self.calls += 1;
            tokio::time::sleep(Duration::from_micros(200)).await;
            if self.calls % 2 == 0 {
                Err(BackendError::Injected)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Backend for Alternating {
        fn name(&self) -> &'static str {
            "alternating"
        }

        async fn open_session(&self) -> Result<Box<dyn Session>, BackendError> {
            self.opened.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(AlternatingSession { calls: 0 }))
        }
    }

    /// Backend that can never open a session.
    struct Unreachable;

    #[async_trait]
    impl Backend for Unreachable {
        fn name(&self) -> &'static str {
            "unreachable"
        }

        async fn open_session(&self) -> Result<Box<dyn Session>, BackendError> {
            Err(BackendError::Closed)
        }
    }

    /// Log sink shared between the subscriber and the test.
    #[derive(Clone, Default)]
    struct Captured(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn aggregator() -> Arc<MetricsAggregator> {
        Arc::new(MetricsAggregator::new(&DEFAULT_BOUNDS_MS).unwrap())
    }

    #[tokio::test]
    async fn test_rejects_zero_concurrency() {
        let (_tx, rx) = watch::channel(false);
        let result = WorkerPool::spawn(0, Arc::new(Stuck), aggregator(), None, rx);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_drops_in_flight_work() {
        let (tx, rx) = watch::channel(false);
        let metrics = aggregator();
        let pool = WorkerPool::spawn(4, Arc::new(Stuck), Arc::clone(&metrics), None, rx).unwrap();
        assert_eq!(pool.len(), 4);

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(2), pool.join())
            .await
            .expect("workers did not stop promptly")
            .unwrap();
        assert_eq!(stats.len(), 4);
        assert!(stats.iter().all(|s| s.successes == 0 && s.failures == 0));
        assert_eq!(metrics.snapshot_total().histogram.count(), 0);
    }

    #[tokio::test]
    async fn test_worker_tallies_match_aggregator() {
        let (tx, rx) = watch::channel(false);
        let metrics = aggregator();
        let samples = Arc::new(SampleRecorder::new());
        let backend = Arc::new(Alternating {
            opened: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn(
            3,
            backend.clone(),
            Arc::clone(&metrics),
            Some(Arc::clone(&samples)),
            rx,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let stats = pool.join().await.unwrap();

        let ok: u64 = stats.iter().map(|s| s.successes).sum();
        let err: u64 = stats.iter().map(|s| s.failures).sum();
        let total = metrics.snapshot_total();
        assert!(ok > 0);
        assert_eq!(total.successes, ok);
        assert_eq!(total.failures, err);
        assert_eq!(total.histogram.count(), ok);
        assert_eq!(samples.len() as u64, ok);
        // Sessions are kept for the whole run, one per worker.
        assert_eq!(backend.opened.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_already_cancelled_pool_does_no_work() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let metrics = aggregator();
        let backend = Arc::new(Alternating {
            opened: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn(2, backend.clone(), Arc::clone(&metrics), None, rx).unwrap();
        pool.join().await.unwrap();

        let total = metrics.snapshot_total();
        assert_eq!(total.successes + total.failures, 0);
        assert_eq!(backend.opened.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_open_failures_warn_once_per_worker() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (tx, rx) = watch::channel(false);
        let metrics = aggregator();
        let pool =
            WorkerPool::spawn(2, Arc::new(Unreachable), Arc::clone(&metrics), None, rx).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        pool.join().await.unwrap();

        let failures = metrics.snapshot_total().failures;
        assert!(failures > 2);

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        let lines: Vec<&str> = output
            .lines()
            .filter(|line| line.contains("failed to open session"))
            .collect();
        assert_eq!(lines.iter().filter(|line| line.contains("WARN")).count(), 2);
        assert_eq!(lines.len() as u64, failures);
    }
}
