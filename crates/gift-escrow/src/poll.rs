//! Bounded polling for external confirmations.

use crate::config::ConfirmationConfig;
use crate::error::GiftError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How often and how long to poll.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl From<&ConfirmationConfig> for PollPolicy {
    fn from(config: &ConfirmationConfig) -> Self {
        Self {
            interval: config.poll_interval,
            max_attempts: config.max_attempts,
        }
    }
}

/// Call `check` until it yields a settled value (`Some`), a hard error, or the
/// attempt budget runs out. Transient errors consume an attempt and are logged.
pub async fn poll_until<T, F, Fut>(
    label: &str,
    policy: PollPolicy,
    mut check: F,
) -> Result<T, GiftError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, GiftError>>,
{
    for attempt in 1..=policy.max_attempts {
        match check().await {
            Ok(Some(settled)) => return Ok(settled),
            Ok(None) => debug!("{} still pending (attempt {})", label, attempt),
            Err(e) if e.is_transient() => {
                warn!("{} check failed (attempt {}): {}", label, attempt, e)
            }
            Err(e) => return Err(e),
        }

        if attempt < policy.max_attempts {
            sleep(policy.interval).await;
        }
    }

    Err(GiftError::ConfirmationTimeout(label.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn test_settles_after_pending_and_transient() {
        let calls = AtomicU32::new(0);
        let result = poll_until("tx", policy(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    0 => Ok(None),
                    1 => Err(GiftError::RpcError("blip".into())),
                    _ => Ok(Some(n)),
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_hard_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = poll_until("tx", policy(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GiftError::TxFailed("rejected".into())) }
        })
        .await;

        assert!(matches!(result, Err(GiftError::TxFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = poll_until("tx", policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
        .await;

        assert!(matches!(result, Err(GiftError::ConfirmationTimeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
