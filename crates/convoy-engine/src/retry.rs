//! Bounded retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::DeploymentConfig;
use crate::resources::ResourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&DeploymentConfig> for RetryPolicy {
    fn from(config: &DeploymentConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// Non-transient failure, or transient failures on every attempt.
    Failed { attempts: u32, error: ResourceError },
    /// The cancel token fired while waiting between attempts.
    Cancelled,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling from
    /// `initial_backoff` up to `max_backoff`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, exhausts its
    /// attempts, or `cancel` fires between attempts.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResourceError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    debug!(attempt, ?delay, %error, "transient failure, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    }
                }
                Err(error) => return Err(RetryError::Failed { attempts: attempt, error }),
            }
        }
    }
}
