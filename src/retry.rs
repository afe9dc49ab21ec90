//! Retry with exponential backoff.
//!
//! [`do_with_retry`] is the only place that retries. It calls the attempt
//! function until it succeeds, fails with an error that is not
//! [retryable](crate::error::ClamdError::is_retryable), or the attempt budget
//! runs out. Delays double from `min_backoff` up to `max_backoff`:
//!
//! ```text
//! attempt:  1      2        3          4          5 ...
//! delay:    0      min      2·min      4·min      ... ≤ max
//! ```

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{ClamdError, Result};
use crate::exchange::Interrupt;
use crate::options::RetryPolicy;

/// Outcome of a successful call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Raw response bytes.
    pub body: Bytes,
    /// Exchange attempts used, including the successful one.
    pub attempts: u32,
}

impl Response {
    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Delay before the given attempt (1-based); zero for the first.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }

    let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
    policy
        .min_backoff
        .checked_mul(factor)
        .unwrap_or(policy.max_backoff)
        .min(policy.max_backoff)
}

/// Run `attempt_fn` under `policy`.
///
/// `attempt_fn` receives the 1-based attempt number. At most
/// `max(policy.max_retries, 1)` attempts are made; once they are used up the
/// last error is returned. Backoff sleeps end early with `Cancelled` when
/// `interrupt` fires.
pub async fn do_with_retry<F, Fut>(
    policy: &RetryPolicy,
    interrupt: &Interrupt,
    mut attempt_fn: F,
) -> Result<Response>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Bytes>>,
{
    let max_attempts = policy.max_retries.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        if attempt > 1 {
            let delay = backoff_delay(policy, attempt);
            tokio::select! {
                biased;
                _ = interrupt.fired() => return Err(ClamdError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match attempt_fn(attempt).await {
            Ok(body) => {
                return Ok(Response {
                    body,
                    attempts: attempt,
                })
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                tracing::warn!(
                    "Attempt {}/{} failed: {}; retrying in {:?}",
                    attempt,
                    max_attempts,
                    e,
                    backoff_delay(policy, attempt + 1)
                );
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::warn!("Giving up after {} attempts: {}", attempt, e);
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;
    use crate::error::TransportStage;

    fn policy(max_retries: u32, min_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            min_backoff: Duration::from_millis(min_ms),
            max_backoff: Duration::from_millis(max_ms),
        }
    }

    fn reset() -> ClamdError {
        ClamdError::transport(
            TransportStage::Dial,
            io::Error::from(io::ErrorKind::ConnectionReset),
        )
    }

    #[test]
    fn test_backoff_schedule() {
        let p = policy(10, 10, 100);
        let delays: Vec<u64> = (1..=7)
            .map(|n| backoff_delay(&p, n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![0, 10, 20, 40, 80, 100, 100]);
    }

    #[test]
    fn test_backoff_saturates_on_huge_attempts() {
        let p = policy(u32::MAX, 500, 2000);
        assert_eq!(backoff_delay(&p, 40), Duration::from_secs(2));
        assert_eq!(backoff_delay(&p, u32::MAX), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_has_no_delay() {
        let started = Instant::now();
        let resp = do_with_retry(&policy(3, 1000, 5000), &Interrupt::new(), |_| async {
            Ok(Bytes::from_static(b"PONG\n"))
        })
        .await
        .unwrap();

        assert_eq!(resp.attempts, 1);
        assert_eq!(resp.text(), "PONG\n");
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_success() {
        let calls = AtomicU32::new(0);
        let p = policy(6, 10, 40);
        let started = Instant::now();

        let resp = do_with_retry(&p, &Interrupt::new(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt <= 4 {
                    Err(reset())
                } else {
                    Ok(Bytes::from_static(b"ok"))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(resp.attempts, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // 10 + 20 + 40 + 40
        assert!(started.elapsed() >= Duration::from_millis(110));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_returns_immediately() {
        let calls = AtomicU32::new(0);

        let err = do_with_retry(&policy(5, 10, 100), &Interrupt::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClamdError::Protocol("garbage".into())) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ClamdError::Protocol(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);

        let err = do_with_retry(&policy(3, 10, 100), &Interrupt::new(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Err(ClamdError::transport(
                    TransportStage::Write,
                    io::Error::new(io::ErrorKind::BrokenPipe, format!("attempt {attempt}")),
                ))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("attempt 3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_retries_still_attempts_once() {
        let calls = AtomicU32::new(0);

        let result = do_with_retry(&policy(0, 10, 100), &Interrupt::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(reset()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let interrupt = Interrupt::new().with_timeout(Duration::from_millis(50));
        let calls = AtomicU32::new(0);

        let err = do_with_retry(&policy(5, 1000, 5000), &interrupt, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(reset()) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ClamdError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
