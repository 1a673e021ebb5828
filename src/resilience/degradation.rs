//! 优雅降级：主路径失败后按顺序尝试备选，全部失败时汇总每一步的错误

use futures_util::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;

use super::{CallError, CallErrorKind};

/// 带降级标记的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Degraded<T> {
    pub value: T,
    /// 实际提供结果的来源
    pub served_by: String,
    /// 是否由备选提供
    pub degraded: bool,
}

impl<T> Degraded<T> {
    pub fn primary(value: T, served_by: impl Into<String>) -> Self {
        Self {
            value,
            served_by: served_by.into(),
            degraded: false,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Degraded<U> {
        Degraded {
            value: f(self.value),
            served_by: self.served_by,
            degraded: self.degraded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptFailure {
    pub source: String,
    pub kind: CallErrorKind,
    pub error: String,
}

/// 主路径与全部备选均失败
#[derive(Error, Debug, Clone, PartialEq)]
#[error("primary {primary} and {} fallback(s) failed: {}", .failures.len().saturating_sub(1), summarize(.failures))]
pub struct FallbackExhausted {
    pub primary: String,
    /// 按尝试顺序，第一项为主路径
    pub failures: Vec<AttemptFailure>,
}

impl FallbackExhausted {
    /// 每个目标都被熔断器直接拒绝（没有发出任何调用）
    pub fn all_circuit_open(&self) -> bool {
        !self.failures.is_empty() && self.failures.iter().all(|f| f.kind == CallErrorKind::CircuitOpen)
    }

    pub fn was_cancelled(&self) -> bool {
        self.failures.iter().any(|f| f.kind == CallErrorKind::Cancelled)
    }
}

fn summarize(failures: &[AttemptFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.source, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

type Attempt<'a, T> = Box<dyn FnOnce() -> BoxFuture<'a, Result<T, CallError>> + Send + 'a>;

/// 降级链构建器
///
/// ```ignore
/// let result = GracefulDegradation::new("db-agent", || call_db().boxed())
///     .fallback("cache", || read_cache().boxed())
///     .run()
///     .await?;
/// ```
pub struct GracefulDegradation<'a, T> {
    steps: Vec<(String, Attempt<'a, T>)>,
}

impl<'a, T: Send + 'a> GracefulDegradation<'a, T> {
    pub fn new<F>(primary: impl Into<String>, op: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'a, Result<T, CallError>> + Send + 'a,
    {
        Self {
            steps: vec![(primary.into(), Box::new(op))],
        }
    }

    pub fn fallback<F>(mut self, source: impl Into<String>, op: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'a, Result<T, CallError>> + Send + 'a,
    {
        self.steps.push((source.into(), Box::new(op)));
        self
    }

    pub async fn run(self) -> Result<Degraded<T>, FallbackExhausted> {
        let primary = self.steps.first().map(|(name, _)| name.clone()).unwrap_or_default();
        let mut failures = Vec::new();

        for (index, (source, op)) in self.steps.into_iter().enumerate() {
            match op().await {
                Ok(value) => {
                    if index > 0 {
                        tracing::warn!(primary = %primary, served_by = %source, "Serving degraded result");
                    }
                    return Ok(Degraded {
                        value,
                        served_by: source,
                        degraded: index > 0,
                    });
                }
                Err(e) => {
                    tracing::warn!(source = %source, "Attempt failed: {}", e);
                    failures.push(AttemptFailure {
                        source,
                        kind: e.kind(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Err(FallbackExhausted { primary, failures })
    }
}
