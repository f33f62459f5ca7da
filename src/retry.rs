//! Bounded exponential backoff around fallible async operations.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::warn;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Terminal,
}

/// The last error from the wrapped operation, annotated with how many
/// attempts were made.
#[derive(Debug)]
pub struct RetryError<E> {
    pub error: E,
    pub attempts: u32,
}

/// Runs `op` up to `policy.max_attempts` times. Waits
/// `min(base × 2^k, cap) × (1 + jitter)` between attempts, jitter drawn
/// uniformly from [0, 1) per wait. Terminal errors return immediately;
/// a sleep that would cross `deadline` returns the last error instead of
/// waiting it out.
pub async fn run<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    deadline: Option<Instant>,
    mut op: F,
    classify: C,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> ErrorClass,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let attempts = attempt + 1;
                if classify(&error) == ErrorClass::Terminal || attempts >= max_attempts {
                    return Err(RetryError { error, attempts });
                }

                let delay = backoff_delay(policy, attempt);
                if let Some(deadline) = deadline {
                    if Instant::now() + delay > deadline {
                        return Err(RetryError { error, attempts });
                    }
                }

                warn!(
                    attempt = attempts,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retry_attempt"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponential = (policy.base_delay.as_secs_f64() * 2f64.powi(attempt.min(32) as i32))
        .min(policy.max_delay.as_secs_f64());
    let jitter: f64 = rand::random();
    Duration::from_secs_f64(exponential * (1.0 + jitter))
}
