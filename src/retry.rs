use std::thread;
use std::time::Duration;

use reqwest::blocking::{RequestBuilder, Response};
use tracing::warn;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Exponential delay before retry number `attempt` (1-based), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Result<T, SyncError>,
    {
        let mut attempt = 1u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(operation = what, attempt, delay_ms = delay.as_millis() as u64, error = %err, "transient failure, retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Sends an HTTP request, retrying 5xx responses and timeouts.
///
/// Connection failures are returned immediately as [`SyncError::Connection`] so the
/// caller can switch endpoints; 4xx responses are handed back untouched.
pub fn send_with_retries<F>(
    policy: &RetryPolicy,
    what: &str,
    mut make_req: F,
) -> Result<Response, SyncError>
where
    F: FnMut() -> RequestBuilder,
{
    policy.run(what, || match make_req().send() {
        Ok(resp) if resp.status().is_server_error() => {
            let status = resp.status().as_u16();
            let message = resp
                .text()
                .unwrap_or_else(|_| "server error".to_string());
            Err(SyncError::Publish {
                product: what.to_string(),
                status,
                message,
            })
        }
        Ok(resp) => Ok(resp),
        Err(err) => Err(classify_http_error(&err)),
    })
}

pub fn classify_http_error(err: &reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Timeout(err.to_string())
    } else if err.is_connect() {
        SyncError::Connection(err.to_string())
    } else {
        SyncError::CatalogHttp(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use assert_matches::assert_matches;

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
    }

    #[test]
    fn retries_transient_errors_until_success() {
        let calls = Cell::new(0);
        let value = fast_policy(3)
            .run("op", || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(SyncError::Publish {
                        product: "p".to_string(),
                        status: 503,
                        message: String::new(),
                    })
                } else {
                    Ok(7)
                }
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let calls = Cell::new(0);
        let err = fast_policy(5)
            .run("op", || -> Result<(), SyncError> {
                calls.set(calls.get() + 1);
                Err(SyncError::Publish {
                    product: "p".to_string(),
                    status: 404,
                    message: String::new(),
                })
            })
            .unwrap_err();
        assert_matches!(err, SyncError::Publish { status: 404, .. });
        assert_eq!(calls.get(), 1);
    }
}
