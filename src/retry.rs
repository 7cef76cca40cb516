use log::{debug, warn};
use std::{fmt::Display, future::Future, time::Duration};
use tokio::time::sleep;

/// Bounded retry with a backoff pause between attempts.
///
/// `run` returns the first success immediately and the last error once all
/// attempts are exhausted.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

#[derive(Clone, Copy, Debug)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { initial: Duration },
}

impl Backoff {
    /// Pause after the attempt with index `attempt` has failed.
    fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { initial } => {
                initial.saturating_mul(2u32.saturating_pow(attempt))
            }
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            // at least one attempt
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `action` up to `max_attempts` times. The action receives the
    /// zero-based attempt index.
    pub async fn run<T, E, F, Fut>(&self, mut action: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            match action(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < self.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        "attempt {} of {} failed: {e}, retrying in {delay:?}",
                        attempt + 1,
                        self.max_attempts
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(
                        "attempt {} of {} failed: {e}, giving up",
                        attempt + 1,
                        self.max_attempts
                    );
                    return Err(e);
                }
            }
        }
    }
}
