use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::IngestError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
pub enum Attempted<T> {
    Success { value: T, attempts: u32 },
    Failed { error: IngestError, attempts: u32 },
}

impl RetryPolicy {
    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn run<T, F>(&self, label: &str, mut op: F) -> Attempted<T>
    where
        F: FnMut(u32) -> Result<T, IngestError>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            match op(attempt) {
                Ok(value) => {
                    return Attempted::Success {
                        value,
                        attempts: attempt,
                    };
                }
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        target: "retry",
                        label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "transient failure, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(error) => {
                    return Attempted::Failed {
                        error,
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }

    #[test]
    fn stops_after_max_attempts() {
        let policy = RetryPolicy::no_delay(3);
        let mut calls = 0;
        let outcome: Attempted<()> = policy.run("test", |_| {
            calls += 1;
            Err(IngestError::DownloadHttp("connection reset".to_string()))
        });
        assert_eq!(calls, 3);
        assert_matches!(outcome, Attempted::Failed { attempts: 3, .. });
    }

    #[test]
    fn permanent_error_is_not_retried() {
        let policy = RetryPolicy::no_delay(5);
        let mut calls = 0;
        let outcome: Attempted<()> = policy.run("test", |_| {
            calls += 1;
            Err(IngestError::DownloadStatus {
                status: 404,
                message: "not found".to_string(),
            })
        });
        assert_eq!(calls, 1);
        assert_matches!(outcome, Attempted::Failed { attempts: 1, .. });
    }

    #[test]
    fn succeeds_after_transient_failure() {
        let policy = RetryPolicy::no_delay(3);
        let outcome = policy.run("test", |attempt| {
            if attempt == 1 {
                Err(IngestError::ShortRead {
                    expected: 10,
                    received: 4,
                })
            } else {
                Ok(attempt)
            }
        });
        assert_matches!(outcome, Attempted::Success { value: 2, attempts: 2 });
    }
}
