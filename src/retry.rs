//! Deadline-bounded polling and bounded-attempt retry.
//!
//! Both helpers run on the tokio monotonic clock, so paused-time tests see the
//! same schedule production does.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// The polled condition never became ready before the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineExceeded {
    pub waited: Duration,
}

/// Every attempt failed; carries the error from the final one.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last: E,
}

impl std::fmt::Display for DeadlineExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "deadline exceeded after {:?}", self.waited)
    }
}

impl<E: Display> Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gave up after {} attempts: {}", self.attempts, self.last)
    }
}

/// Poll `check` every `interval` until it yields a value or `timeout` elapses.
///
/// `Ok(None)` means "not yet". Errors are treated as transient and retried.
/// The check always runs at least once, even with a zero timeout.
pub async fn poll_until<T, E, F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Result<T, DeadlineExceeded>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    E: Display,
{
    let started = Instant::now();
    // `None` when the timeout lies past the clock's range: poll without limit.
    let deadline = started.checked_add(timeout);

    loop {
        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "transient error while polling"),
        }

        let now = Instant::now();
        let pause = match deadline {
            Some(deadline) if now >= deadline => {
                return Err(DeadlineExceeded {
                    waited: now - started,
                });
            }
            Some(deadline) => interval.min(deadline - now),
            None => interval,
        };
        tokio::time::sleep(pause).await;
    }
}

/// Run `op` up to `attempts` times, sleeping `backoff` between failures.
///
/// `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(
    attempts: u32,
    backoff: Duration,
    mut op: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(last) if attempt >= attempts => return Err(RetryExhausted { attempts, last }),
            Err(e) => {
                warn!(attempt, max_attempts = attempts, error = %e, "attempt failed, retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_returns_first_ready_value() {
        let calls = &AtomicU32::new(0);
        let result = poll_until(Duration::from_secs(10), Duration::from_secs(1), move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 3 {
                Ok::<_, String>(Some(n))
            } else if n == 2 {
                Err("connection reset".to_string())
            } else {
                Ok(None)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_accepts_unbounded_timeout() {
        let calls = &AtomicU32::new(0);
        let result = poll_until(Duration::MAX, Duration::from_secs(1), move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok::<_, String>((n == 2).then_some(n))
        })
        .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_respects_deadline() {
        let started = Instant::now();
        let result = poll_until(Duration::from_secs(5), Duration::from_secs(2), || async {
            Ok::<Option<()>, String>(None)
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.waited, Duration::from_secs(5));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_checks_once_with_zero_timeout() {
        let calls = &AtomicU32::new(0);
        let result = poll_until(Duration::ZERO, Duration::from_secs(1), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<Option<()>, String>(None)
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_after_configured_attempts() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result: Result<(), _> = retry(4, Duration::from_secs(5), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("attempt {attempt} refused")) }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 4);
        assert_eq!(err.last, "attempt 4 refused");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // Three backoffs between four attempts.
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_on_success() {
        let result = retry(5, Duration::from_secs(1), |attempt| async move {
            if attempt < 2 {
                Err("not yet")
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
