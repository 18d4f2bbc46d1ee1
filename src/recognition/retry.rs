use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::RecognitionError;

/// How many times a backend call is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per segment, including the first one. Never zero.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before the next attempt after `attempt` (1-based) failed with `error`.
    ///
    /// Linear in the attempt number, except proxy authentication failures which
    /// wait a flat `base_delay`: hammering harder does not fix a proxy login.
    pub fn backoff(&self, error: &RecognitionError, attempt: u32) -> Duration {
        match error {
            RecognitionError::ProxyAuth => self.base_delay,
            _ => self.base_delay.saturating_mul(attempt.max(1)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}

/// Aggregate retry counts for one backend instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryStats {
    pub segments: usize,
    pub max_retries: u32,
    pub avg_retries: f64,
    pub total_retries: u32,
}

/// Per-segment retry counters. Advisory only: nothing reads them for control flow.
#[derive(Debug, Default)]
pub struct RetryLedger {
    retries: Mutex<HashMap<usize, u32>>,
    auth_reported: AtomicBool,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, segment: usize, retries: u32) {
        if let Ok(mut map) = self.retries.lock() {
            map.insert(segment, retries);
        }
    }

    pub fn stats(&self) -> RetryStats {
        let Ok(map) = self.retries.lock() else {
            return RetryStats::default();
        };
        if map.is_empty() {
            return RetryStats::default();
        }
        let total: u32 = map.values().sum();
        RetryStats {
            segments: map.len(),
            max_retries: map.values().copied().max().unwrap_or(0),
            avg_retries: total as f64 / map.len() as f64,
            total_retries: total,
        }
    }

    /// Log an authentication failure loudly the first time, quietly afterwards.
    fn report_auth_failure(&self, backend: &str, error: &RecognitionError) {
        if !self.auth_reported.swap(true, Ordering::Relaxed) {
            log::error!("{backend}: {error}. Check the service credentials.");
        } else {
            log::debug!("{backend}: {error}");
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retriable error, or the
/// policy's attempt budget is spent.
///
/// The closure receives the 1-based attempt number. Retries used are recorded
/// in `ledger` under `segment` on every exit path.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    ledger: &RetryLedger,
    backend: &str,
    segment: usize,
    mut operation: F,
) -> Result<T, RecognitionError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RecognitionError>>,
{
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => {
                ledger.record(segment, attempt - 1);
                if attempt > 1 {
                    log::debug!("{backend}: segment {segment} succeeded on attempt {attempt}");
                }
                return Ok(value);
            }
            Err(err) if !err.is_retriable() => {
                ledger.record(segment, attempt - 1);
                if matches!(err, RecognitionError::Authentication(_)) {
                    ledger.report_auth_failure(backend, &err);
                }
                return Err(err);
            }
            Err(err) => {
                if attempt >= policy.max_attempts {
                    ledger.record(segment, attempt - 1);
                    log::warn!(
                        "{backend}: max retries reached for segment {segment}: {err}"
                    );
                    return Err(RecognitionError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }

                let delay = policy.backoff(&err, attempt);
                log::warn!(
                    "{backend}: {err} for segment {segment}, retrying ({attempt}/{}) in {delay:?}",
                    policy.max_attempts
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
