//! Retry policy: exponential backoff with jitter
//!
//! Pure decision logic plus the shared attempt loop used by both network
//! stages of the separation job. The loop retries unconditionally up to the
//! attempt cap; transient/permanent classification only shapes user-facing
//! messages, it does not gate retries.

use karaoke_common::config::EngineConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Upper bound (exclusive) of the uniform jitter added to every delay
pub const JITTER_MS: u64 = 1_000;

/// Backoff tuning for one retry loop
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt (R retries = R+1 total attempts)
    pub max_retries: u32,
    /// Base delay before doubling
    pub base_delay_ms: u64,
    /// Delay cap, applied before jitter
    pub max_delay_ms: u64,
}

impl From<&EngineConfig> for RetryPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }
}

/// Compute the backoff delay for a 0-based attempt index:
/// `min(base * 2^attempt, cap) + uniform[0, 1000ms)`
pub fn next_delay(attempt_index: u32, base_delay_ms: u64, max_delay_ms: u64) -> Duration {
    // Shifting the base directly would discard overflowed high bits and
    // collapse the delay toward zero; saturate instead
    let exponential = 1u64
        .checked_shl(attempt_index)
        .and_then(|multiplier| base_delay_ms.checked_mul(multiplier))
        .unwrap_or(u64::MAX);
    let capped = exponential.min(max_delay_ms);
    let jitter = rand::thread_rng().gen_range(0..JITTER_MS);
    Duration::from_millis(capped.saturating_add(jitter))
}

/// Why a retry loop gave up
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Cancellation was requested before the operation could complete
    #[error("Cancelled before completion")]
    Cancelled,

    /// All attempts failed; carries the last attempt's error
    #[error("{0}")]
    Exhausted(E),
}

/// Shared retry loop
///
/// Attempts `op` up to `max_retries + 1` times, sleeping the backoff delay
/// between failed attempts. Cancellation is checked before every attempt and
/// interrupts a backoff sleep immediately, so cancel latency is bounded by
/// the in-flight attempt, never by the remaining backoff schedule.
pub async fn with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    for attempt in 0..=policy.max_retries {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt == policy.max_retries {
                    tracing::warn!(
                        attempts = policy.max_retries + 1,
                        error = %e,
                        "All attempts failed"
                    );
                    return Err(RetryError::Exhausted(e));
                }

                let delay = next_delay(attempt, policy.base_delay_ms, policy.max_delay_ms);
                tracing::debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    unreachable!("loop returns on success, exhaustion, or cancellation")
}
