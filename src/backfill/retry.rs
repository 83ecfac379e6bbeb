use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::exchange::binance_rest::FetchError;

/// How a failed fetch is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 429, or 418 (IP auto-ban after repeated 429s).
    RateLimited,
    /// 400: the requested range is inverted or past the end of the data.
    BadRange,
    /// Network, 5xx, or an undecodable body.
    Transient,
    Fatal,
}

pub fn classify(err: &FetchError) -> Disposition {
    match err {
        FetchError::Http { status, .. } => match *status {
            429 | 418 => Disposition::RateLimited,
            400 => Disposition::BadRange,
            500..=599 => Disposition::Transient,
            _ => Disposition::Fatal,
        },
        FetchError::Transport(_) | FetchError::Decode(_) => Disposition::Transient,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("exhausted {attempts} attempts, last error: {last}")]
    ExhaustedRetries { attempts: u32, last: FetchError },
    #[error("unrecoverable fetch error: {0}")]
    Fatal(FetchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// `2^attempt` seconds, attempt counted from 0.
    pub fn backoff(attempt: u32) -> Duration {
        Duration::from_secs(1u64 << attempt.min(16))
    }

    /// Run `operation` until it yields rows, a bad-range signal (returned as an empty
    /// batch), a fatal status, or the attempt budget runs out. Rate-limit and transient
    /// retries share one counter. No sleep follows the final attempt.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<Vec<T>, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<T>, FetchError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            let err = match operation().await {
                Ok(rows) => return Ok(rows),
                Err(err) => err,
            };
            let disposition = classify(&err);
            match disposition {
                Disposition::BadRange => return Ok(Vec::new()),
                Disposition::Fatal => return Err(RetryError::Fatal(err)),
                Disposition::RateLimited | Disposition::Transient => {}
            }
            if attempt + 1 >= max_attempts {
                return Err(RetryError::ExhaustedRetries {
                    attempts: max_attempts,
                    last: err,
                });
            }
            let delay = Self::backoff(attempt);
            warn!(
                attempt = attempt + 1,
                max_attempts,
                delay_secs = delay.as_secs(),
                cause = %err,
                "fetch failed ({disposition:?}), backing off"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn http(status: u16) -> FetchError {
        FetchError::Http {
            status,
            body: String::new(),
        }
    }

    /// Replays `script` one entry per attempt and records when each attempt started.
    async fn run_script(
        policy: RetryPolicy,
        script: Vec<Result<Vec<u32>, FetchError>>,
    ) -> (Result<Vec<u32>, RetryError>, Vec<Duration>) {
        let start = Instant::now();
        let script = Arc::new(Mutex::new(script.into_iter()));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let result = policy
            .execute(|| {
                calls.lock().unwrap().push(start.elapsed());
                let next = script.lock().unwrap().next();
                async move { next.expect("script exhausted") }
            })
            .await;
        let calls = calls.lock().unwrap().clone();
        (result, calls)
    }

    #[test]
    fn classify_statuses() {
        assert_eq!(classify(&http(429)), Disposition::RateLimited);
        assert_eq!(classify(&http(418)), Disposition::RateLimited);
        assert_eq!(classify(&http(400)), Disposition::BadRange);
        assert_eq!(classify(&http(503)), Disposition::Transient);
        assert_eq!(classify(&http(403)), Disposition::Fatal);
        assert_eq!(classify(&http(404)), Disposition::Fatal);
        assert_eq!(
            classify(&FetchError::Transport("dns".to_string())),
            Disposition::Transient
        );
        assert_eq!(
            classify(&FetchError::Decode("eof".to_string())),
            Disposition::Transient
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_twice_then_ok() {
        let (result, calls) = run_script(
            RetryPolicy::default(),
            vec![Err(http(429)), Err(http(429)), Ok(vec![7])],
        )
        .await;
        assert_eq!(result.unwrap(), vec![7]);
        assert_eq!(
            calls,
            vec![
                Duration::ZERO,
                Duration::from_secs(1),
                Duration::from_secs(3)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bad_request_is_empty_without_sleep() {
        let start = Instant::now();
        let (result, calls) = run_script(RetryPolicy::default(), vec![Err(http(400))]).await;
        assert!(result.unwrap().is_empty());
        assert_eq!(calls.len(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn five_transient_failures_exhaust() {
        let start = Instant::now();
        let script = (0..5)
            .map(|_| Err(FetchError::Transport("connection reset".to_string())))
            .collect();
        let (result, calls) = run_script(RetryPolicy::new(5), script).await;
        match result {
            Err(RetryError::ExhaustedRetries { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("expected exhausted retries, got {other:?}"),
        }
        assert_eq!(calls.len(), 5);
        // 1 + 2 + 4 + 8; nothing after the last attempt
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_is_fatal_immediately() {
        let (result, calls) = run_script(RetryPolicy::default(), vec![Err(http(403))]).await;
        assert!(matches!(result, Err(RetryError::Fatal(_))));
        assert_eq!(calls.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_and_transient_share_budget() {
        let (result, calls) = run_script(
            RetryPolicy::new(3),
            vec![Err(http(429)), Err(http(502)), Err(http(418))],
        )
        .await;
        assert!(matches!(result, Err(RetryError::ExhaustedRetries { .. })));
        assert_eq!(calls.len(), 3);
    }
}
