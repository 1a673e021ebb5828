//! 编排错误类型
//!
//! 纯本地计算（分类、打分、合并）不产生错误；远程调用失败在弹性层内部转为下一个备选，
//! 只有主组件与全部备选都耗尽时才以结构化错误返回给调用方。

use serde::Serialize;
use thiserror::Error;

use crate::resilience::{AttemptFailure, CallError, FallbackExhausted};
use crate::routing::{RegistryError, RoutingError};
use crate::state::{StateError, SyncError};
use crate::transport::TransportError;
use crate::workflow::WorkflowError;

/// Saga 补偿失败
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompensationFailure {
    pub step: String,
    pub component: String,
    pub error: String,
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("No capable component for {domains:?} (best score {best_score:.1}, minimum {min_viable:.1})")]
    NoCapableComponent {
        domains: Vec<String>,
        best_score: f64,
        min_viable: f64,
    },

    #[error("Component {component} unavailable: {reason}")]
    ComponentUnavailable { component: String, reason: String },

    #[error("Remote call in step {step} failed: {source}")]
    RemoteCallFailed {
        step: String,
        #[source]
        source: CallError,
    },

    #[error("{strategy}: all targets exhausted (primary {primary}): {}", describe_failures(.failures))]
    AllFallbacksFailed {
        strategy: String,
        primary: String,
        failures: Vec<AttemptFailure>,
    },

    #[error("Saga step {step} failed: {cause}; {} compensation failure(s)", .compensation_failures.len())]
    SagaStepFailed {
        step: String,
        #[source]
        cause: Box<OrchestratorError>,
        /// 已成功补偿的步骤（逆序）
        compensated: Vec<String>,
        /// 按尝试顺序（逆序）
        compensation_failures: Vec<CompensationFailure>,
    },

    #[error("Step {step} timed out after {timeout_ms}ms")]
    StepTimeout { step: String, timeout_ms: u64 },

    #[error("{} parallel step(s) failed: {}", .failures.len(), describe_pairs(.failures))]
    ParallelStepsFailed { failures: Vec<(String, String)> },

    #[error("Workflow {workflow_id} cancelled")]
    Cancelled { workflow_id: String },

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(#[from] WorkflowError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("State sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl OrchestratorError {
    /// 把降级链耗尽转换为对外错误
    pub fn from_exhausted(strategy: impl Into<String>, exhausted: FallbackExhausted) -> Self {
        if exhausted.all_circuit_open() {
            let reason = exhausted
                .failures
                .first()
                .map(|f| f.error.clone())
                .unwrap_or_default();
            return OrchestratorError::ComponentUnavailable {
                component: exhausted.primary,
                reason,
            };
        }
        OrchestratorError::AllFallbacksFailed {
            strategy: strategy.into(),
            primary: exhausted.primary,
            failures: exhausted.failures,
        }
    }

    /// 用于日志与统计的短类别名
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::NoCapableComponent { .. } => "no_capable_component",
            OrchestratorError::ComponentUnavailable { .. } => "component_unavailable",
            OrchestratorError::RemoteCallFailed { .. } => "remote_call_failed",
            OrchestratorError::AllFallbacksFailed { .. } => "all_fallbacks_failed",
            OrchestratorError::SagaStepFailed { .. } => "saga_step_failed",
            OrchestratorError::StepTimeout { .. } => "step_timeout",
            OrchestratorError::ParallelStepsFailed { .. } => "parallel_steps_failed",
            OrchestratorError::Cancelled { .. } => "cancelled",
            OrchestratorError::InvalidWorkflow(_) => "invalid_workflow",
            OrchestratorError::State(_) => "state",
            OrchestratorError::Transport(_) => "transport",
            OrchestratorError::Sync(_) => "sync",
            OrchestratorError::Registry(_) => "registry",
        }
    }
}

impl From<RoutingError> for OrchestratorError {
    fn from(err: RoutingError) -> Self {
        match err {
            RoutingError::NoCapableComponent {
                domains,
                best_score,
                min_viable,
            } => OrchestratorError::NoCapableComponent {
                domains,
                best_score,
                min_viable,
            },
        }
    }
}

fn describe_failures(failures: &[AttemptFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.source, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

fn describe_pairs(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(step, error)| format!("{step}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}
