//! Retry as data: a policy maps an attempt number and the error it hit to a
//! verdict. The loop applying the verdict lives at each call site.

use std::future::Future;
use std::time::Duration;

use log::info;

use crate::error::ClientError;

/// Delay between attempts as a function of the 1-based attempt number.
#[derive(Debug, Clone, Copy)]
pub enum Delay {
    Fixed(Duration),

    /// `base * 2^(attempt-1)`, never above `cap`.
    Exponential { base: Duration, cap: Duration },
}

impl Delay {
    pub fn calculate(&self, attempt: u32) -> Duration {
        match self {
            Delay::Fixed(delay) => *delay,
            Delay::Exponential { base, cap } => {
                // The shift saturates well before the cap does on any sane
                // configuration.
                let exponent = attempt.saturating_sub(1).min(20);
                (*base).saturating_mul(1u32 << exponent).min(*cap)
            }
        }
    }
}

#[derive(Debug)]
pub enum Verdict {
    /// Sleep for the given duration, then try again.
    Retry(Duration),

    /// Stop retrying and fail with the carried error.
    Abort(ClientError),
}

type Predicate = dyn Fn(&ClientError) -> bool + Send + Sync;
type Observer = dyn Fn(u32, &ClientError, Duration) + Send + Sync;

/// Bounded retry with a pluggable delay curve.
///
/// An interrupting predicate short-circuits the cycle, propagating the error
/// verbatim; exhausting `max_attempts` fails with
/// [`ClientError::CannotRetry`].
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Delay,
    interrupting: Option<Box<Predicate>>,
    observer: Option<Box<Observer>>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Delay) -> Self {
        Self {
            max_attempts: max_attempts.min(i32::MAX as u32 - 1),
            delay,
            interrupting: None,
            observer: None,
        }
    }

    /// Policy shaped by the client configuration, interrupted by errors that
    /// retrying cannot fix.
    pub fn from_config(config: &config::Configuration) -> Self {
        Self::new(
            config.retry.max_attempt,
            Delay::Exponential {
                base: config.retry_delay(),
                cap: config.retry_delay_cap(),
            },
        )
        .interrupting_when(ClientError::is_interrupting)
    }

    pub fn interrupting_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ClientError) -> bool + Send + Sync + 'static,
    {
        self.interrupting = Some(Box::new(predicate));
        self
    }

    pub fn observe_with<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32, &ClientError, Duration) + Send + Sync + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide what to do about `error` hit on the 1-based `attempt`.
    pub fn check(&self, attempt: u32, error: ClientError) -> Verdict {
        if attempt > self.max_attempts {
            return Verdict::Abort(ClientError::CannotRetry {
                attempts: attempt - 1,
                cause: Box::new(error),
            });
        }
        if let Some(predicate) = &self.interrupting {
            if predicate(&error) {
                return Verdict::Abort(error);
            }
        }
        let delay = self.delay.calculate(attempt);
        if let Some(observer) = &self.observer {
            observer(attempt, &error, delay);
        }
        Verdict::Retry(delay)
    }

    /// The canonical applying loop, for call sites without special needs.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => match self.check(attempt, error) {
                    Verdict::Retry(delay) => {
                        info!(
                            "Attempt {} failed, retrying in {:?} (max {})",
                            attempt, delay, self.max_attempts
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Verdict::Abort(error) => return Err(error),
                },
            }
        }
    }
}
