//! Bounded exponential-backoff retry for storage writes

use crate::error::Result;
use crate::utils::backoff_delay;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

/// How often and how patiently a failing storage call is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Policy that tries exactly once
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Run `op` until it succeeds or `max_attempts` is exhausted, returning the last error
    pub async fn run<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_unless(what, op, |_| false).await
    }

    /// Like [`RetryPolicy::run`], but errors matching `permanent` are returned at once
    pub async fn run_unless<T, F, Fut, P>(&self, what: &str, mut op: F, permanent: P) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&anyhow::Error) -> bool,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if permanent(&e) => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= attempts {
                        error!("{} failed after {} attempts: {}", what, attempts, e);
                        return Err(e);
                    }

                    let delay = backoff_delay(self.initial_backoff, self.max_backoff, attempt - 1);
                    warn!(
                        "{} attempt {} failed: {}. Retrying in {:?}",
                        what, attempt, e, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
