//! 重试策略
//!
//! `max_retries` 为首次尝试之后的额外次数；第 n 次重试前等待 `delay_for_attempt(n)`，
//! 上限 `max_delay`。熔断拒绝与取消永不重试。

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{CallError, CallErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Linear,
    #[default]
    Exponential,
    Fibonacci,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    /// 可重试的错误类别；None 表示除熔断/取消外全部可重试
    pub retryable: Option<HashSet<CallErrorKind>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff: Backoff::Exponential,
            retryable: None,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// 第 `attempt` 次重试（从 1 开始）前的等待时间
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let multiplier: u64 = match self.backoff {
            Backoff::Linear => u64::from(attempt),
            Backoff::Exponential => 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX),
            Backoff::Fibonacci => fibonacci(attempt),
        };
        let multiplier = u32::try_from(multiplier).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn is_retryable(&self, err: &CallError) -> bool {
        match err.kind() {
            CallErrorKind::CircuitOpen | CallErrorKind::Cancelled => false,
            kind => self.retryable.as_ref().map_or(true, |set| set.contains(&kind)),
        }
    }

    /// 执行 `op`，失败时按策略重试；返回最后一次结果
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, CallError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut attempt = 0u32;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= self.max_retries || !self.is_retryable(&err) {
                return Err(err);
            }
            attempt += 1;
            let delay = self.delay_for_attempt(attempt);
            tracing::debug!(target_component = err.target(), attempt, ?delay, "Retrying call: {}", err);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CallError::Cancelled { target: err.target().to_string() });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(backoff: Backoff) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(45),
            backoff,
            retryable: None,
        }
    }

    fn network(target: &str) -> CallError {
        CallError::Network {
            target: target.into(),
            message: "reset".into(),
        }
    }

    #[test]
    fn test_backoff_sequences_are_capped() {
        let ms = |p: &RetryPolicy| (1..=5).map(|n| p.delay_for_attempt(n).as_millis()).collect::<Vec<_>>();
        assert_eq!(ms(&policy(Backoff::Linear)), vec![10, 20, 30, 40, 45]);
        assert_eq!(ms(&policy(Backoff::Exponential)), vec![10, 20, 40, 45, 45]);
        assert_eq!(ms(&policy(Backoff::Fibonacci)), vec![10, 10, 20, 30, 45]);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let p = policy(Backoff::Exponential);
        assert_eq!(p.delay_for_attempt(200), Duration::from_millis(45));
    }

    #[test]
    fn test_retryable_allow_list() {
        let mut p = policy(Backoff::Linear);
        p.retryable = Some([CallErrorKind::Timeout].into_iter().collect());
        assert!(!p.is_retryable(&network("x")));
        assert!(p.is_retryable(&CallError::Timeout {
            target: "x".into(),
            timeout_ms: 1
        }));
        assert!(!policy(Backoff::Linear).is_retryable(&CallError::CircuitOpen {
            target: "x".into(),
            retry_in_ms: 5
        }));
    }

    #[tokio::test]
    async fn test_execute_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = policy(Backoff::Linear)
            .execute(&CancellationToken::new(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(network("x"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(Backoff::Linear)
            .execute(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(network("x")) }
            })
            .await;
        assert_eq!(result, Err(network("x")));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = policy(Backoff::Linear)
            .execute(&cancel, |_| async { Err(network("x")) })
            .await;
        assert!(matches!(result, Err(CallError::Cancelled { .. })));
    }
}
