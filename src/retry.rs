use std::{future::Future, time::Duration};

use async_trait::async_trait;

use crate::config::RetryConfig;

/// Suspension point used between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// A non-retryable failure stopped the loop at `attempt` (0-indexed).
    Aborted { attempt: u32, error: E },
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
}

/// Bounded exponential backoff: the delay before retry `n` (0-indexed) is
/// `base_delay * 2^n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            base_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_retries, config.base_delay)
    }

    #[cfg(test)]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Runs `op` until it succeeds, fails with an error `retryable` rejects,
    /// or attempts run out. `on_retry` sees each retryable failure together
    /// with the delay about to be slept.
    pub async fn run<T, E, Op, Fut, P, N>(
        &self,
        sleeper: &dyn Sleeper,
        mut op: Op,
        retryable: P,
        mut on_retry: N,
    ) -> Result<T, RetryError<E>>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        N: FnMut(u32, &E, Duration),
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if !retryable(&error) => {
                    return Err(RetryError::Aborted { attempt, error });
                }
                Err(error) => {
                    if attempt + 1 >= self.max_attempts {
                        return Err(RetryError::Exhausted {
                            attempts: attempt + 1,
                            last: error,
                        });
                    }
                    let delay = self.backoff(attempt);
                    on_retry(attempt, &error, delay);
                    sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
