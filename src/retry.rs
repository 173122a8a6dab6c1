//! Bounded retry with a recovery step between attempts.
//!
//! Page interaction is flaky: elements go stale, pop-ups steal clicks and
//! waits time out. [`RetryPolicy::run`] isolates that flakiness from the scan
//! logic. Only [`Transient`] errors are retried; anything else is returned
//! straight away.
//!
//! # Retry Strategy
//!
//! - The operation runs once, then up to `max_attempts` more times
//! - Before each retry the `recover` action runs (e.g. reload the page)
//! - An optional pause with small random jitter precedes recovery
//! - A failing `recover` ends the retry loop with its own error

use crate::error::Transient;
use rand::{Rng, rng};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, instrument, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_attempts: usize,
    /// Pause before recovering; zero disables pausing and jitter.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Run `operation`, recovering and retrying on transient failures.
    ///
    /// # Returns
    ///
    /// The first successful result, the first non-transient error, the error
    /// of a failed recovery, or the last transient error once attempts are
    /// exhausted.
    #[instrument(level = "debug", skip_all, fields(%label))]
    pub async fn run<T, E, Op, Fut, Rec, RecFut>(
        &self,
        label: &str,
        mut operation: Op,
        mut recover: Rec,
    ) -> Result<T, E>
    where
        E: Transient + fmt::Display,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Rec: FnMut() -> RecFut,
        RecFut: Future<Output = Result<(), E>>,
    {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    let total_dt = total_t0.elapsed();

                    if attempt > self.max_attempts {
                        error!(
                            attempt,
                            max = self.max_attempts,
                            elapsed_ms_total = total_dt.as_millis(),
                            error = %e,
                            "retries exhausted"
                        );
                        return Err(e);
                    }

                    warn!(
                        attempt,
                        max = self.max_attempts,
                        elapsed_ms_total = total_dt.as_millis(),
                        error = %e,
                        "transient failure; recovering before retry"
                    );

                    if !self.delay.is_zero() {
                        let jitter_ms: u64 = rng().random_range(0..=250);
                        sleep(self.delay + Duration::from_millis(jitter_ms)).await;
                    }
                    recover().await?;
                }
            }
        }
    }
}
