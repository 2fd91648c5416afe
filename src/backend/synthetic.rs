//! In-process backend that simulates a unit of work by sleeping.
//!
//! Useful for exercising the engine without any external service: latency,
//! jitter, and failure rate are all configurable.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Backend, BackendError, Session};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Base latency of one unit of work.
    pub latency: Duration,

    /// Uniform jitter applied as `latency ± jitter`, floored at zero.
    pub jitter: Duration,

    /// Probability in `0.0..=1.0` that a unit of work fails.
    pub failure_rate: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(1),
            jitter: Duration::ZERO,
            failure_rate: 0.0,
        }
    }
}

pub struct SyntheticBackend {
    config: SyntheticConfig,
}

impl SyntheticBackend {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Backend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn open_session(&self) -> Result<Box<dyn Session>, BackendError> {
        Ok(Box::new(SyntheticSession {
            config: self.config.clone(),
        }))
    }
}

struct SyntheticSession {
    config: SyntheticConfig,
}

impl SyntheticSession {
    fn next_delay(&self, rng: &mut impl Rng) -> Duration {
        let base = self.config.latency.as_nanos() as i128;
        let jitter = self.config.jitter.as_nanos() as i128;
        if jitter == 0 {
            return self.config.latency;
        }
        let offset = rng.gen_range(-jitter..=jitter);
        let nanos = (base + offset).max(0);
        Duration::from_nanos(nanos.min(u64::MAX as i128) as u64)
    }
}

#[async_trait]
impl Session for SyntheticSession {
    async fn execute(&mut self) -> Result<(), BackendError> {
        // ThreadRng is !Send, so draw everything before the first await.
        let (delay, fail) = {
            let mut rng = rand::thread_rng();
            let delay = self.next_delay(&mut rng);
            let fail = self.config.failure_rate > 0.0 && rng.gen_bool(self.config.failure_rate);
            (delay, fail)
        };

        if delay.is_zero() {
            // Keep a zero-latency loop from starving timers on this runtime thread.
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }

        if fail {
            Err(BackendError::Injected)
        } else {
            Ok(())
        }
    }
}
