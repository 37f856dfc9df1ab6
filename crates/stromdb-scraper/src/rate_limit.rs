//! Pacing and retry utilities.
//!
//! The source penalizes aggressive clients, so retries use a fixed delay
//! rather than exponential backoff, and callers keep exactly one request in
//! flight. Non-retriable errors are returned after the first attempt.

use std::future::Future;
use std::time::Duration;

/// The final result of a retried operation plus the number of attempts made.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: T,
    pub attempts: u32,
}

/// Executes `operation` up to `max_attempts` times, sleeping `delay` between
/// attempts while `is_retriable` accepts the error.
///
/// `max_attempts` counts the first try; `0` is treated as `1`.
///
/// # Schedule (example with `max_attempts = 3`, `delay = 5s`)
///
/// | Attempt | Sleep before attempt |
/// |---------|----------------------|
/// | 1       | none                 |
/// | 2       | 5 s                  |
/// | 3       | 5 s                  |
pub async fn retry_with_delay<T, E, F, Fut, R>(
    max_attempts: u32,
    delay: Duration,
    is_retriable: R,
    mut operation: F,
) -> Attempted<Result<T, E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1u32;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) => {
                if !is_retriable(&err) || attempt >= max_attempts {
                    return Attempted {
                        result: Err(err),
                        attempts: attempt,
                    };
                }
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "transient failure, retrying after fixed delay"
                );
            }
        }

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Sleeps for `delay_ms` unless it is zero.
pub async fn pause(delay_ms: u64) {
    if delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}
