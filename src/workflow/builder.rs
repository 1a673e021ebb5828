//! 工作流构建器
//!
//! 提供流畅的API来构建工作流

use std::collections::HashSet;
use std::time::Duration;

use serde_json::Value;

use crate::workflow::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainKind {
    Sequential,
    Parallel,
    Conditional,
    Saga,
}

/// 工作流构建器
pub struct WorkflowBuilder {
    id: WorkflowId,
    name: String,
    input: Value,
    kind: ChainKind,
    steps: Vec<WorkflowStep>,
    else_steps: Vec<WorkflowStep>,
    predicate: Option<Predicate>,
    step_timeout: Option<Duration>,
}

impl WorkflowBuilder {
    /// 创建新的工作流构建器（默认顺序链）
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: format!("wf_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            input: Value::Null,
            kind: ChainKind::Sequential,
            steps: Vec::new(),
            else_steps: Vec::new(),
            predicate: None,
            step_timeout: None,
        }
    }

    /// 指定工作流 ID
    pub fn id(mut self, id: impl Into<WorkflowId>) -> Self {
        self.id = id.into();
        self
    }

    /// 设置初始输入
    pub fn input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// 并行链
    pub fn parallel(mut self) -> Self {
        self.kind = ChainKind::Parallel;
        self
    }

    /// Saga 链
    pub fn saga(mut self) -> Self {
        self.kind = ChainKind::Saga;
        self
    }

    /// 条件链：谓词对初始输入求值
    pub fn conditional(mut self, predicate: Predicate) -> Self {
        self.kind = ChainKind::Conditional;
        self.predicate = Some(predicate);
        self
    }

    /// 添加步骤（条件链中为 true 分支）
    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// 条件链的 false 分支步骤
    pub fn else_step(mut self, step: WorkflowStep) -> Self {
        self.else_steps.push(step);
        self
    }

    /// 并行链的单步超时
    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    /// 构建工作流
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        if self.steps.is_empty() {
            return Err(WorkflowError::EmptyChain);
        }
        if !self.else_steps.is_empty() && self.kind != ChainKind::Conditional {
            return Err(WorkflowError::InvalidConfiguration(
                "else steps require a conditional chain".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for step in self.steps.iter().chain(&self.else_steps) {
            if !names.insert(step.name.as_str()) {
                return Err(WorkflowError::DuplicateStep(step.name.clone()));
            }
            if step.target.trim().is_empty() {
                return Err(WorkflowError::InvalidStep {
                    step: step.name.clone(),
                    reason: "target is required".to_string(),
                });
            }
            if step.operation.trim().is_empty() {
                return Err(WorkflowError::InvalidStep {
                    step: step.name.clone(),
                    reason: "operation is required".to_string(),
                });
            }
        }

        let chain = match self.kind {
            ChainKind::Sequential => Chain::Sequential { steps: self.steps },
            ChainKind::Parallel => Chain::Parallel {
                steps: self.steps,
                step_timeout_ms: self.step_timeout.map(|d| d.as_millis() as u64),
            },
            ChainKind::Saga => {
                for step in self.steps.iter().filter(|s| s.compensation.is_none()) {
                    tracing::debug!(step = %step.name, "Saga step has no compensation");
                }
                Chain::Saga { steps: self.steps }
            }
            ChainKind::Conditional => Chain::Conditional {
                predicate: self.predicate.unwrap_or(Predicate::Always),
                on_true: self.steps,
                on_false: (!self.else_steps.is_empty()).then_some(self.else_steps),
            },
        };

        Ok(Workflow {
            id: self.id,
            name: self.name,
            chain,
            input: self.input,
            created_at: chrono::Utc::now().timestamp_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_sequential_workflow() {
        let workflow = WorkflowBuilder::new("Deploy")
            .input(json!({"service": "api"}))
            .step(WorkflowStep::new("build", "ci-agent", "build"))
            .step(WorkflowStep::new("ship", "cd-agent", "deploy").transform(Transform::Identity))
            .build()
            .expect("Failed to build workflow");

        assert_eq!(workflow.name, "Deploy");
        assert!(workflow.id.starts_with("wf_"));
        assert!(matches!(workflow.chain, Chain::Sequential { ref steps } if steps.len() == 2));
    }

    #[test]
    fn test_build_without_steps_fails() {
        assert_eq!(WorkflowBuilder::new("Test").build(), Err(WorkflowError::EmptyChain));
    }

    #[test]
    fn test_duplicate_step_names_rejected() {
        let result = WorkflowBuilder::new("Test")
            .step(WorkflowStep::new("a", "x", "op"))
            .step(WorkflowStep::new("a", "y", "op"))
            .build();
        assert_eq!(result, Err(WorkflowError::DuplicateStep("a".into())));
    }

    #[test]
    fn test_missing_target_rejected() {
        let result = WorkflowBuilder::new("Test").step(WorkflowStep::new("a", " ", "op")).build();
        assert!(matches!(result, Err(WorkflowError::InvalidStep { .. })));
    }

    #[test]
    fn test_conditional_and_parallel() {
        let conditional = WorkflowBuilder::new("Branch")
            .conditional(Predicate::truthy("/fast"))
            .step(WorkflowStep::new("quick", "a", "op"))
            .else_step(WorkflowStep::new("slow", "b", "op"))
            .build()
            .unwrap();
        assert!(matches!(conditional.chain, Chain::Conditional { on_false: Some(_), .. }));

        let parallel = WorkflowBuilder::new("Fan-out")
            .parallel()
            .step_timeout(Duration::from_millis(250))
            .step(WorkflowStep::new("a", "x", "op"))
            .build()
            .unwrap();
        assert!(matches!(parallel.chain, Chain::Parallel { step_timeout_ms: Some(250), .. }));

        let misplaced = WorkflowBuilder::new("Bad")
            .step(WorkflowStep::new("a", "x", "op"))
            .else_step(WorkflowStep::new("b", "x", "op"))
            .build();
        assert!(matches!(misplaced, Err(WorkflowError::InvalidConfiguration(_))));
    }
}
