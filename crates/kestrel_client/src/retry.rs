//! Retry classification and backoff.

use std::time::{Duration, Instant};

use kestrel_common::{KestrelError, KestrelResult};
use rand::Rng;

pub const DEFAULT_BASE_RETRY_DELAY: Duration = Duration::from_millis(70);
pub const DEFAULT_MAX_BACKOFF_DELAY: Duration = Duration::from_secs(20);

/// Decides whether to retry and how long to back off.
#[derive(Debug, Clone)]
pub struct Retryer {
    pub base_throttle_delay: Duration,
    pub max_backoff: Duration,
}

impl Default for Retryer {
    fn default() -> Retryer {
        Retryer {
            base_throttle_delay: DEFAULT_BASE_RETRY_DELAY,
            max_backoff: DEFAULT_MAX_BACKOFF_DELAY,
        }
    }
}

impl Retryer {
    pub fn is_retryable(&self, err: &KestrelError) -> bool {
        err.is_retryable()
    }

    /// Backoff before retry number `attempt` (one-based). Throttling
    /// failures get exponential backoff with jitter in `[0.5, 1.0)`;
    /// everything else returns zero so the caller's fixed delay applies.
    pub fn retry_delay(&self, attempt: u32, err: &KestrelError) -> Duration {
        if !err.is_throttle() {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(31);
        let exp = self
            .base_throttle_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff);
        exp.mul_f64(rand::thread_rng().gen_range(0.5..1.0))
    }
}

/// Sleep for `delay`, waking early with a canceled error when the request
/// deadline fires first.
pub async fn sleep_with_deadline(
    op: &str,
    delay: Duration,
    deadline: Option<Instant>,
) -> KestrelResult<()> {
    if delay.is_zero() {
        return Ok(());
    }
    match deadline {
        Some(d) => {
            if tokio::time::timeout_at(d.into(), tokio::time::sleep(delay))
                .await
                .is_err()
            {
                return Err(KestrelError::Canceled(format!(
                    "{op}: deadline exceeded during retry backoff"
                )));
            }
            Ok(())
        }
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::error::ERR_CODE_THROTTLING;
    use kestrel_common::Fault;

    fn throttle_error() -> KestrelError {
        KestrelError::server_failure(vec![], ERR_CODE_THROTTLING, "", "", 400, Fault::Client)
    }

    #[test]
    fn test_non_throttle_delay_is_zero() {
        let retryer = Retryer::default();
        let err = KestrelError::server_failure(vec![2], "empty", "", "", 500, Fault::Server);
        assert_eq!(retryer.retry_delay(1, &err), Duration::ZERO);
        assert_eq!(retryer.retry_delay(1, &KestrelError::PoolClosed), Duration::ZERO);
    }

    #[test]
    fn test_throttle_delay_bounds() {
        let retryer = Retryer::default();
        let err = throttle_error();
        for attempt in 1..6 {
            let delay = retryer.retry_delay(attempt, &err);
            let ceiling = DEFAULT_BASE_RETRY_DELAY * (1 << (attempt - 1));
            assert!(delay >= ceiling.mul_f64(0.5), "attempt {attempt}: {delay:?}");
            assert!(delay < ceiling, "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn test_first_throttle_delay_at_least_half_base() {
        let retryer = Retryer::default();
        let delay = retryer.retry_delay(1, &throttle_error());
        assert!(delay >= DEFAULT_BASE_RETRY_DELAY.mul_f64(0.5));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let retryer = Retryer::default();
        let delay = retryer.retry_delay(40, &throttle_error());
        assert!(delay <= DEFAULT_MAX_BACKOFF_DELAY);
    }

    #[tokio::test]
    async fn test_sleep_completes_without_deadline() {
        sleep_with_deadline("GetItem", Duration::from_millis(5), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sleep_canceled_by_deadline() {
        let deadline = Instant::now() + Duration::from_millis(10);
        let err = sleep_with_deadline("GetItem", Duration::from_secs(5), Some(deadline))
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::Canceled(_)));
        assert!(err.is_canceled());
    }
}
