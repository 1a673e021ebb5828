//! 工作流类型定义
//!
//! 定义链（顺序 / 并行 / 条件 / Saga）、步骤、条件谓词与输入变换等核心数据类型。
//! 谓词和变换都是可序列化的数据，而不是闭包，便于跨实例传递与记录。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub type WorkflowId = String;

/// 工作流状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// 已创建，等待执行
    Created,
    /// 正在执行
    Running,
    /// 已完成
    Completed,
    /// 执行失败
    Failed,
    /// Saga 失败并已回滚
    Compensated,
    /// 已取消
    Cancelled,
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Completed,
    /// 条件不满足
    Skipped,
    Failed,
}

/// 条件谓词，对上一步结果求值
///
/// `pointer` 为 JSON Pointer（RFC 6901），空串表示整个值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    Always,
    Exists { pointer: String },
    Equals { pointer: String, value: Value },
    Truthy { pointer: String },
    Not { predicate: Box<Predicate> },
    All { predicates: Vec<Predicate> },
    Any { predicates: Vec<Predicate> },
}

impl Predicate {
    pub fn equals(pointer: impl Into<String>, value: Value) -> Self {
        Predicate::Equals {
            pointer: pointer.into(),
            value,
        }
    }

    pub fn truthy(pointer: impl Into<String>) -> Self {
        Predicate::Truthy {
            pointer: pointer.into(),
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not {
            predicate: Box::new(self),
        }
    }

    pub fn evaluate(&self, value: &Value) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Exists { pointer } => value.pointer(pointer).is_some_and(|v| !v.is_null()),
            Predicate::Equals { pointer, value: expected } => value.pointer(pointer) == Some(expected),
            Predicate::Truthy { pointer } => value.pointer(pointer).is_some_and(is_truthy),
            Predicate::Not { predicate } => !predicate.evaluate(value),
            Predicate::All { predicates } => predicates.iter().all(|p| p.evaluate(value)),
            Predicate::Any { predicates } => predicates.iter().any(|p| p.evaluate(value)),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// 把上一步结果映射为本步输入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    /// 上一步结果原样作为输入
    Identity,
    /// 取上一步结果的子值
    Pointer { pointer: String },
    /// 把上一步结果写入本步静态输入的字段
    Wrap { field: String },
}

impl Transform {
    pub fn apply(&self, previous: &Value, own_input: &Value) -> Value {
        match self {
            Transform::Identity => previous.clone(),
            Transform::Pointer { pointer } => previous.pointer(pointer).cloned().unwrap_or(Value::Null),
            Transform::Wrap { field } => {
                let mut input = match own_input {
                    Value::Object(map) => map.clone(),
                    Value::Null => serde_json::Map::new(),
                    other => {
                        let mut map = serde_json::Map::new();
                        map.insert("input".to_string(), other.clone());
                        map
                    }
                };
                input.insert(field.clone(), previous.clone());
                Value::Object(input)
            }
        }
    }
}

/// Saga 补偿操作，在原步骤实际执行的组件上调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compensation {
    pub operation: String,
    /// 缺省为 `{"input": 原输入, "result": 原结果}`
    #[serde(default)]
    pub input: Option<Value>,
}

impl Compensation {
    pub fn input_for(&self, step_input: &Value, step_result: &Value) -> Value {
        self.input
            .clone()
            .unwrap_or_else(|| json!({ "input": step_input, "result": step_result }))
    }
}

/// 工作流中的一次远程调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    pub operation: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub condition: Option<Predicate>,
    #[serde(default)]
    pub transform: Option<Transform>,
    #[serde(default)]
    pub compensation: Option<Compensation>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl WorkflowStep {
    pub fn new(name: impl Into<String>, target: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            fallbacks: Vec::new(),
            operation: operation.into(),
            input: Value::Null,
            condition: None,
            transform: None,
            compensation: None,
            timeout_ms: None,
        }
    }

    pub fn input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn fallback(mut self, target: impl Into<String>) -> Self {
        self.fallbacks.push(target.into());
        self
    }

    pub fn when(mut self, condition: Predicate) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn compensate(mut self, operation: impl Into<String>) -> Self {
        self.compensation = Some(Compensation {
            operation: operation.into(),
            input: None,
        });
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// 主目标 + 备选
    pub fn targets(&self) -> Vec<String> {
        std::iter::once(self.target.clone())
            .chain(self.fallbacks.iter().filter(|f| **f != self.target).cloned())
            .collect()
    }

    /// 计算本步输入：有变换时作用于上一步结果，否则使用静态输入（为空时沿用上一步结果）
    pub fn resolve_input(&self, previous: &Value) -> Value {
        match &self.transform {
            Some(transform) => transform.apply(previous, &self.input),
            None if self.input.is_null() => previous.clone(),
            None => self.input.clone(),
        }
    }
}

/// 执行链
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Chain {
    Sequential {
        steps: Vec<WorkflowStep>,
    },
    Parallel {
        steps: Vec<WorkflowStep>,
        #[serde(default)]
        step_timeout_ms: Option<u64>,
    },
    Conditional {
        predicate: Predicate,
        on_true: Vec<WorkflowStep>,
        #[serde(default)]
        on_false: Option<Vec<WorkflowStep>>,
    },
    Saga {
        steps: Vec<WorkflowStep>,
    },
}

impl Chain {
    pub fn kind(&self) -> &'static str {
        match self {
            Chain::Sequential { .. } => "sequential",
            Chain::Parallel { .. } => "parallel",
            Chain::Conditional { .. } => "conditional",
            Chain::Saga { .. } => "saga",
        }
    }

    pub fn steps(&self) -> Vec<&WorkflowStep> {
        match self {
            Chain::Sequential { steps } | Chain::Parallel { steps, .. } | Chain::Saga { steps } => steps.iter().collect(),
            Chain::Conditional { on_true, on_false, .. } => on_true
                .iter()
                .chain(on_false.iter().flatten())
                .collect(),
        }
    }
}

/// 工作流定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// 工作流唯一标识
    pub id: WorkflowId,
    /// 工作流名称
    pub name: String,
    pub chain: Chain,
    /// 初始输入（第一步的「上一步结果」）
    #[serde(default)]
    pub input: Value,
    /// 创建时间
    pub created_at: i64,
}

/// 单步执行记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub step: String,
    pub state: StepState,
    pub served_by: Option<String>,
    pub degraded: bool,
    pub output: Option<Value>,
    pub duration_ms: u64,
}

impl StepRecord {
    pub fn skipped(step: &str) -> Self {
        Self {
            step: step.to_string(),
            state: StepState::Skipped,
            served_by: None,
            degraded: false,
            output: None,
            duration_ms: 0,
        }
    }
}

/// Saga 中已完成的步骤，用于逆序补偿
#[derive(Debug, Clone)]
pub struct SagaEntry {
    pub step: WorkflowStep,
    pub input: Value,
    pub result: Value,
    pub served_by: String,
}

#[derive(Debug, Clone, Default)]
pub struct SagaRecord {
    pub completed: Vec<SagaEntry>,
}

/// 工作流执行结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowResult {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    pub output: Value,
    pub steps: Vec<StepRecord>,
    /// 任一步由备选组件提供
    pub degraded: bool,
}

/// 工作流构建错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow has no steps")]
    EmptyChain,
    #[error("Duplicate step name: {0}")]
    DuplicateStep(String),
    #[error("Invalid step {step}: {reason}")]
    InvalidStep { step: String, reason: String },
    #[error("Invalid workflow configuration: {0}")]
    InvalidConfiguration(String),
}
