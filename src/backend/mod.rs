//! # Unit-of-Work Backends
//!
//! The metrics engine does not know what it is timing. A [`Backend`] hands
//! each worker a [`Session`], and the worker times [`Session::execute`]
//! calls. Each call is one unit of work: one round trip that either
//! succeeds or fails with a [`BackendError`].
//!
//! Sessions are owned by exactly one worker, so they can hold a connection
//! without any locking. Whether a session keeps its connection across calls
//! or opens a new one for every call is chosen by [`ConnectionMode`].
//!
//! Cancellation is handled by the caller: a worker drops the in-flight
//! `execute` future when the run is cancelled, so implementations only
//! need to be cancel-safe (no state left half-updated across an `.await`
//! that matters for the next call).

use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::utils::format_bytes;

pub mod synthetic;
pub mod tcp;

pub use synthetic::{SyntheticBackend, SyntheticConfig};
pub use tcp::{TcpBackend, TcpConfig};

/// Failure of a single unit of work.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed by peer")]
    Closed,

    #[error("echo mismatch: sent {sent} bytes, received {received} matching bytes")]
    ShortRead { sent: usize, received: usize },

    #[error("injected failure")]
    Injected,
}

/// How a session manages its connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    /// Keep one connection per worker for the whole run.
    #[default]
    #[value(name = "long-running")]
    LongRunning,

    /// Open and close a connection inside every unit of work.
    #[value(name = "per-transaction")]
    PerTransaction,
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionMode::LongRunning => write!(f, "long-running"),
            ConnectionMode::PerTransaction => write!(f, "per-transaction"),
        }
    }
}

/// Per-worker handle used to run units of work.
#[async_trait]
pub trait Session: Send {
    /// Run one unit of work.
    async fn execute(&mut self) -> Result<(), BackendError>;

    /// Release any held connection. Called once when the worker exits.
    async fn close(&mut self) {}
}

/// Source of sessions; shared by every worker.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short identifier used in logs and results.
    fn name(&self) -> &'static str;

    /// Create a session for one worker.
    async fn open_session(&self) -> Result<Box<dyn Session>, BackendError>;
}

/// Backend selection plus its settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackendConfig {
    Synthetic(SyntheticConfig),
    Tcp(TcpConfig),
}

impl BackendConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            BackendConfig::Synthetic(cfg) => {
                if !(0.0..=1.0).contains(&cfg.failure_rate) {
                    bail!(
                        "Synthetic failure rate must be between 0.0 and 1.0, got {}",
                        cfg.failure_rate
                    );
                }
            }
            BackendConfig::Tcp(cfg) => {
                if cfg.target.trim().is_empty() {
                    bail!("TCP backend needs a --target address");
                }
                if cfg.payload_size == 0 {
                    bail!("TCP payload size cannot be zero");
                }
                if cfg.io_timeout.is_zero() {
                    bail!("TCP I/O timeout must be greater than zero");
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendConfig::Synthetic(cfg) => write!(
                f,
                "synthetic (latency={:?} jitter={:?} failure_rate={})",
                cfg.latency, cfg.jitter, cfg.failure_rate
            ),
            BackendConfig::Tcp(cfg) => write!(
                f,
                "tcp (target={} payload={} mode={} timeout={:?})",
                cfg.target,
                format_bytes(cfg.payload_size as u64),
                cfg.connection_mode,
                cfg.io_timeout
            ),
        }
    }
}

/// Factory for backend instances.
pub struct BackendFactory;

impl BackendFactory {
    pub fn create(config: &BackendConfig) -> Result<Arc<dyn Backend>> {
        config.validate()?;
        match config {
            BackendConfig::Synthetic(cfg) => Ok(Arc::new(SyntheticBackend::new(cfg.clone()))),
            BackendConfig::Tcp(cfg) => Ok(Arc::new(TcpBackend::new(cfg.clone()))),
        }
    }
}
