//! 弹性层：熔断器、重试策略、降级链，以及组合三者的 `ResilienceLayer`
//!
//! 所有远程调用都经过 `ResilienceLayer`：每个 (caller, target) 一个熔断器，
//! 单目标失败按 `RetryPolicy` 重试，目标耗尽后沿备选组件降级。

pub mod caller;
pub mod circuit_breaker;
pub mod degradation;
pub mod retry;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportError;

pub use caller::ResilienceLayer;
pub use circuit_breaker::{BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use degradation::{AttemptFailure, Degraded, FallbackExhausted, GracefulDegradation};
pub use retry::{Backoff, RetryPolicy};

/// 远程调用错误的类别（用于可重试白名单）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    Timeout,
    Network,
    Remote,
    CircuitOpen,
    Cancelled,
}

/// 单次远程调用失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Call to {target} timed out after {timeout_ms}ms")]
    Timeout { target: String, timeout_ms: u64 },

    #[error("Network error calling {target}: {message}")]
    Network { target: String, message: String },

    #[error("{target} returned error: {message}")]
    Remote { target: String, message: String },

    #[error("Circuit open for {target} (retry in {retry_in_ms}ms)")]
    CircuitOpen { target: String, retry_in_ms: u64 },

    #[error("Call to {target} cancelled")]
    Cancelled { target: String },
}

impl CallError {
    pub fn kind(&self) -> CallErrorKind {
        match self {
            CallError::Timeout { .. } => CallErrorKind::Timeout,
            CallError::Network { .. } => CallErrorKind::Network,
            CallError::Remote { .. } => CallErrorKind::Remote,
            CallError::CircuitOpen { .. } => CallErrorKind::CircuitOpen,
            CallError::Cancelled { .. } => CallErrorKind::Cancelled,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            CallError::Timeout { target, .. }
            | CallError::Network { target, .. }
            | CallError::Remote { target, .. }
            | CallError::CircuitOpen { target, .. }
            | CallError::Cancelled { target } => target,
        }
    }

    /// 把传输层错误归类为调用错误
    pub fn from_transport(target: &str, err: TransportError) -> Self {
        let target = target.to_string();
        match err {
            TransportError::Timeout { timeout_ms, .. } => CallError::Timeout { target, timeout_ms },
            TransportError::Remote(message) => CallError::Remote { target, message },
            TransportError::UnknownMethod(name) => CallError::Remote {
                target,
                message: format!("unknown method {name}"),
            },
            other => CallError::Network {
                target,
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_classified() {
        let timeout = CallError::from_transport(
            "x",
            TransportError::Timeout {
                destination: "x".into(),
                timeout_ms: 10,
            },
        );
        assert_eq!(timeout.kind(), CallErrorKind::Timeout);

        let no_route = CallError::from_transport("x", TransportError::NoRoute("x".into()));
        assert_eq!(no_route.kind(), CallErrorKind::Network);
        assert_eq!(no_route.target(), "x");

        let remote = CallError::from_transport("x", TransportError::Remote("boom".into()));
        assert_eq!(remote.kind(), CallErrorKind::Remote);
    }
}
