//! 把路由决策展开为可执行的工作流
//!
//! - single：单步，目标为主组件，备选即决策的备选
//! - sequential_collaboration：按阶段顺序的顺序链，后续阶段通过 `previous` 字段拿到前一阶段结果
//! - parallel_collaboration：各阶段组成并行链，结果按阶段名汇合

use serde_json::{json, Value};

use crate::routing::{CollaborationPhase, ExecutionStrategy, RoutingDecision, RoutingRequest};
use crate::workflow::builder::WorkflowBuilder;
use crate::workflow::types::{Transform, Workflow, WorkflowError, WorkflowStep};

/// 请求未指定操作时使用的默认操作名
pub const DEFAULT_OPERATION: &str = "handle";

/// 根据决策生成工作流
pub fn plan_from_decision(decision: &RoutingDecision, request: &RoutingRequest) -> Result<Workflow, WorkflowError> {
    let operation = request.operation.clone().unwrap_or_else(|| DEFAULT_OPERATION.to_string());
    let request_input = request_input(request);
    let name = format!("route-{}", decision.request_id);
    let builder = WorkflowBuilder::new(name).id(format!("wf_{}", decision.request_id));

    let phases = match (&decision.strategy, &decision.collaboration) {
        (ExecutionStrategy::Single, _) | (_, None) => {
            let mut step = WorkflowStep::new("route", &decision.primary, &operation).input(request_input.clone());
            for fallback in &decision.fallbacks {
                step = step.fallback(fallback);
            }
            return builder.input(request_input).step(step).build();
        }
        (_, Some(plan)) => &plan.phases,
    };

    let targets = decision.targets();
    let steps = phases.iter().enumerate().map(|(index, phase)| {
        let mut step = WorkflowStep::new(phase_name(phase), &phase.component, &operation).input(json!({
            "request": request.description,
            "payload": request.payload,
            "domain": phase.domain,
        }));
        for fallback in targets.iter().filter(|t| **t != phase.component) {
            step = step.fallback(fallback);
        }
        if index > 0 && decision.strategy == ExecutionStrategy::SequentialCollaboration {
            step = step.transform(Transform::Wrap {
                field: "previous".to_string(),
            });
        }
        step
    });

    let builder = match decision.strategy {
        ExecutionStrategy::ParallelCollaboration => builder.parallel(),
        _ => builder,
    };
    steps.fold(builder.input(request_input), |b, step| b.step(step)).build()
}

fn phase_name(phase: &CollaborationPhase) -> String {
    format!("{}-{}", phase.domain, phase.component)
}

fn request_input(request: &RoutingRequest) -> Value {
    if request.payload.is_null() {
        json!({ "description": request.description })
    } else {
        request.payload.clone()
    }
}
