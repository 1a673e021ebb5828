//! 熔断器
//!
//! 状态机 Closed -> Open -> HalfOpen -> Closed：
//! - Closed：放行；连续失败达到阈值转 Open 并记录时间
//! - Open：立即拒绝，距上次失败超过 timeout 后下一次调用转 HalfOpen
//! - HalfOpen：放行有限的试探调用；连续 `half_open_retries` 次成功转 Closed，任一失败回 Open
//!
//! 调用方通过 [`CircuitBreaker::acquire`] 拿到 [`CallPermit`]；许可未记录结果就被丢弃
//! （超时、取消、外层 future 被 drop）时自动归还 HalfOpen 试探名额。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// 触发熔断的连续失败次数
    pub failure_threshold: u32,
    /// Open 持续时间（自最后一次失败起算）
    pub timeout: Duration,
    /// HalfOpen 转 Closed 所需的连续成功次数，同时也是并发试探上限
    pub half_open_retries: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            half_open_retries: 3,
        }
    }
}

/// 状态迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: BreakerState,
    pub to: BreakerState,
}

/// 被熔断器拒绝
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    /// 距离允许试探还需等待的时间（HalfOpen 试探名额已满时为 0）
    pub retry_in: Duration,
}

/// 对外可见的熔断器快照
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub caller: String,
    pub target: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub half_open_trials: u32,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    half_open_successes: u32,
    half_open_in_flight: u32,
    /// 每次进入 HalfOpen 加一，过期许可据此识别
    half_open_epoch: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                half_open_successes: 0,
                half_open_in_flight: 0,
                half_open_epoch: 0,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// 当前状态（不触发 Open -> HalfOpen 迁移）
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// 申请一次调用许可，返回随结果一起归还的 [`CallPermit`]
    pub fn acquire(self: &Arc<Self>) -> Result<(CallPermit, Option<Transition>), Rejected> {
        let (transition, half_open_epoch) = self.admit(Instant::now())?;
        let permit = CallPermit {
            breaker: Arc::clone(self),
            half_open_epoch,
            settled: false,
        };
        Ok((permit, transition))
    }

    /// 只做准入判断，不跟踪许可的归还
    pub fn try_acquire_at(&self, now: Instant) -> Result<Option<Transition>, Rejected> {
        self.admit(now).map(|(transition, _)| transition)
    }

    /// 准入；在 HalfOpen 下放行时同时返回所属的试探轮次
    fn admit(&self, now: Instant) -> Result<(Option<Transition>, Option<u64>), Rejected> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok((None, None)),
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(self.config.timeout);
                if elapsed >= self.config.timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = 1;
                    inner.half_open_epoch += 1;
                    let transition = Transition {
                        from: BreakerState::Open,
                        to: BreakerState::HalfOpen,
                    };
                    Ok((Some(transition), Some(inner.half_open_epoch)))
                } else {
                    Err(Rejected {
                        retry_in: self.config.timeout - elapsed,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_retries.max(1) {
                    inner.half_open_in_flight += 1;
                    Ok((None, Some(inner.half_open_epoch)))
                } else {
                    Err(Rejected {
                        retry_in: Duration::ZERO,
                    })
                }
            }
        }
    }

    pub fn record_success(&self) -> Option<Transition> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                None
            }
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_retries {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = 0;
                    Some(Transition {
                        from: BreakerState::HalfOpen,
                        to: BreakerState::Closed,
                    })
                } else {
                    None
                }
            }
            // 熔断前发出的调用迟到的成功，不改变状态
            BreakerState::Open => None,
        }
    }

    /// 归还试探名额；只对同一轮 HalfOpen 生效
    fn release_trial(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen && inner.half_open_epoch == epoch {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    pub fn record_failure(&self) -> Option<Transition> {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) -> Option<Transition> {
        let mut inner = self.lock();
        inner.last_failure = Some(now);
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    Some(Transition {
                        from: BreakerState::Closed,
                        to: BreakerState::Open,
                    })
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                inner.consecutive_failures += 1;
                inner.state = BreakerState::Open;
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 0;
                Some(Transition {
                    from: BreakerState::HalfOpen,
                    to: BreakerState::Open,
                })
            }
            BreakerState::Open => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 一次调用许可。用 `succeed` / `fail` 记录结果；未记录就 drop 视为放弃
#[must_use = "dropping a permit without recording an outcome abandons the call"]
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    half_open_epoch: Option<u64>,
    settled: bool,
}

impl CallPermit {
    pub fn succeed(mut self) -> Option<Transition> {
        self.settled = true;
        self.breaker.record_success()
    }

    pub fn fail(mut self) -> Option<Transition> {
        self.settled = true;
        self.breaker.record_failure()
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(epoch) = self.half_open_epoch {
            self.breaker.release_trial(epoch);
        }
    }
}

/// 每个 (caller, target) 一个熔断器，首次调用目标时创建
#[derive(Debug)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<(String, String), Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, caller: &str, target: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry((caller.to_string(), target.to_string()))
                .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone()))),
        )
    }

    pub fn get(&self, caller: &str, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(caller.to_string(), target.to_string()))
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<BreakerSnapshot> = breakers
            .iter()
            .map(|((caller, target), breaker)| {
                let inner = breaker.lock();
                BreakerSnapshot {
                    caller: caller.clone(),
                    target: target.clone(),
                    state: inner.state,
                    consecutive_failures: inner.consecutive_failures,
                    half_open_trials: inner.half_open_successes + inner.half_open_in_flight,
                }
            })
            .collect();
        out.sort_by(|a, b| (&a.caller, &a.target).cmp(&(&b.caller, &b.target)));
        out
    }
}
