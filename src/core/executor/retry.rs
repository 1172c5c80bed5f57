use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use super::TaskContext;
use crate::core::error::TransferError;
use crate::core::models::{RecordUpdate, TransferId};
use crate::core::network::NetworkClass;

/// Bounded exponential backoff with full jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the delay before retry `attempt` (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(32));
        Duration::from_millis(exp.min(self.max_delay.as_millis() as u64))
    }

    /// Uniform in `[0, ceiling(attempt))`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..ceiling))
    }
}

/// Whether an operation may be abandoned when the transfer is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Interrupt {
    OnCancel,
    Never,
}

/// Runs `op` until it succeeds, fails for good or the transfer is cancelled.
///
/// Transient errors are retried while the required network is reachable; if
/// it is not, the attempt ends with [`TransferError::NetworkUnavailable`].
/// When an operation finishes in the same instant a cancellation arrives,
/// the finished result wins.
pub(super) async fn with_retry<T, F, Fut>(
    ctx: &TaskContext,
    id: TransferId,
    network: NetworkClass,
    interrupt: Interrupt,
    mut op: F,
) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut attempt = 0u32;
    loop {
        let result = match interrupt {
            Interrupt::OnCancel => {
                tokio::select! {
                    biased;
                    result = op() => result,
                    _ = ctx.token.cancelled() => Err(TransferError::Cancelled),
                }
            }
            Interrupt::Never => op().await,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if interrupt == Interrupt::OnCancel && ctx.token.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if !error.is_retryable() {
            return Err(error);
        }
        if !ctx.monitor.currently_meets(network) {
            return Err(TransferError::NetworkUnavailable(network));
        }
        if attempt >= ctx.options.retry.max_retries {
            return Err(TransferError::RetriesExhausted {
                attempts: attempt,
                last: Box::new(error),
            });
        }

        attempt += 1;
        record_retry(ctx, id).await;
        let delay = ctx.options.retry.delay_for(attempt);
        warn!(
            transfer_id = id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying transfer operation"
        );

        if interrupt == Interrupt::Never {
            tokio::time::sleep(delay).await;
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.token.cancelled() => return Err(TransferError::Cancelled),
        }
    }
}

async fn record_retry(ctx: &TaskContext, id: TransferId) {
    let Some(record) = ctx.updater.snapshot(id).await else {
        return;
    };
    let update = RecordUpdate {
        retry_count: Some(record.retry_count + 1),
        ..Default::default()
    };
    if let Err(e) = ctx.updater.update_record(id, update).await {
        warn!(transfer_id = id, error = %e, "Failed to record retry count");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_doubles_until_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.ceiling(1), Duration::from_millis(200));
        assert_eq!(policy.ceiling(2), Duration::from_millis(400));
        assert_eq!(policy.ceiling(10), Duration::from_secs(20));
        assert_eq!(policy.ceiling(64), Duration::from_secs(20));
    }

    #[test]
    fn delay_stays_below_ceiling() {
        let policy = RetryPolicy::default();
        for attempt in 1..=8 {
            for _ in 0..50 {
                assert!(policy.delay_for(attempt) < policy.ceiling(attempt));
            }
        }
    }

    #[test]
    fn zero_base_means_no_wait() {
        let policy = RetryPolicy {
            base_delay: Duration::ZERO,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(3), Duration::ZERO);
    }
}
