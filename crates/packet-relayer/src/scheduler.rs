// Task driver: runs units of work and applies backoff and stop policy
//
// Long-running loops (height tracking, range sync, wallets) are written as a
// `Task` whose `step` does one iteration. The driver owns sleeping, retry
// backoff, failure limits and cancellation.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{RelayerError, Result};

/// Outcome of one successful iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Run again after the given delay
    Continue(Duration),
    /// The task finished its work
    Done,
}

#[async_trait]
pub trait Task: Send {
    fn name(&self) -> String;

    async fn step(&mut self) -> Result<Step>;
}

/// Retry policy applied when `step` returns an error
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added as random jitter (0.0 to 1.0)
    pub jitter_factor: f64,
    /// Consecutive failures before the task gives up; `None` retries forever
    pub max_consecutive_failures: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_consecutive_failures: None,
        }
    }
}

impl BackoffPolicy {
    pub fn with_max_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = Some(max);
        self
    }

    /// Delay before the retry following the `failures`-th consecutive failure
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let base_ms = (self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent))
            .min(self.max_delay.as_millis() as f64) as u64;
        let max_jitter = (base_ms as f64 * self.jitter_factor.clamp(0.0, 1.0)) as u64;
        let jitter = if max_jitter == 0 {
            0
        } else {
            fastrand::u64(0..=max_jitter)
        };
        Duration::from_millis(base_ms + jitter).min(self.max_delay)
    }
}

/// Sleep for `delay` unless shutdown is signalled first. Returns true on shutdown.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Run `task` until it is done, fails fatally, exhausts its retries or shutdown is signalled
pub async fn drive<T: Task + ?Sized>(
    task: &mut T,
    policy: &BackoffPolicy,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let name = task.name();
    let mut failures = 0u32;

    loop {
        if *shutdown.borrow() {
            debug!("{}: stopped", name);
            return Ok(());
        }

        let delay = match task.step().await {
            Ok(Step::Done) => {
                debug!("{}: done", name);
                return Ok(());
            }
            Ok(Step::Continue(delay)) => {
                failures = 0;
                delay
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                failures += 1;
                if let Some(max) = policy.max_consecutive_failures {
                    if failures >= max {
                        return Err(RelayerError::RetriesExhausted {
                            task: name,
                            failures,
                            last_error: e.to_string(),
                        });
                    }
                }
                let delay = policy.delay(failures);
                warn!(
                    "{}: attempt failed ({} in a row), retrying in {:?}: {}",
                    name, failures, delay, e
                );
                delay
            }
        };

        if wait_or_shutdown(delay, &mut shutdown).await {
            debug!("{}: stopped", name);
            return Ok(());
        }
    }
}
