//! 工作流引擎
//!
//! 按链类型执行工作流，每次远程调用都经过弹性层（熔断 + 重试），再沿步骤的备选组件降级。
//!
//! - Sequential：按声明顺序执行；`condition` 对上一步结果求值，`transform` 把上一步结果映射为输入
//! - Parallel：并发执行（`max_parallel` 限流），汇合全部结果；首个超时取消其余步骤
//! - Conditional：谓词对初始输入求值，选择 true/false 分支（各为顺序链）
//! - Saga：顺序执行；任一步失败时按完成顺序的逆序补偿，补偿失败只记录不中断
//!
//! 状态存储中的记账：
//! - `workflow/<id>/status`：LWW 寄存器
//! - `workflows/active`：OR-Set
//! - `workflows/completed`、`workflows/failed`：GCounter

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::core::error::{CompensationFailure, OrchestratorError};
use crate::resilience::{CallError, Degraded, ResilienceLayer};
use crate::state::StateStore;
use crate::workflow::types::*;

pub const ACTIVE_WORKFLOWS_KEY: &str = "workflows/active";
pub const COMPLETED_WORKFLOWS_KEY: &str = "workflows/completed";
pub const FAILED_WORKFLOWS_KEY: &str = "workflows/failed";

pub fn status_key(workflow_id: &str) -> String {
    format!("workflow/{workflow_id}/status")
}

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// 单次调用的默认超时
    pub step_timeout: Duration,
    /// 并行链的并发上限
    pub max_parallel: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            max_parallel: 8,
        }
    }
}

struct Outcome {
    output: Value,
    steps: Vec<StepRecord>,
    degraded: bool,
}

impl Outcome {
    fn passthrough(input: &Value) -> Self {
        Self {
            output: input.clone(),
            steps: Vec::new(),
            degraded: false,
        }
    }
}

/// 工作流引擎
pub struct WorkflowEngine {
    resilience: Arc<ResilienceLayer>,
    store: Option<Arc<StateStore>>,
    config: WorkflowConfig,
    running: RwLock<HashMap<WorkflowId, CancellationToken>>,
}

impl WorkflowEngine {
    /// 创建新的工作流引擎
    pub fn new(resilience: Arc<ResilienceLayer>, config: WorkflowConfig) -> Self {
        Self {
            resilience,
            store: None,
            config,
            running: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// 正在执行的工作流
    pub async fn running(&self) -> Vec<WorkflowId> {
        let mut ids: Vec<_> = self.running.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 取消正在执行的工作流；取消会传播到所有未完成的并行调用
    pub async fn cancel(&self, workflow_id: &str) -> bool {
        match self.running.read().await.get(workflow_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 执行工作流
    pub async fn execute(
        &self,
        workflow: Workflow,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResult, OrchestratorError> {
        let span = tracing::info_span!("workflow", id = %workflow.id, chain = workflow.chain.kind());
        self.execute_inner(workflow, cancel).instrument(span).await
    }

    async fn execute_inner(
        &self,
        workflow: Workflow,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResult, OrchestratorError> {
        let id = workflow.id.clone();
        let token = cancel.child_token();
        self.running.write().await.insert(id.clone(), token.clone());
        self.record_status(&id, WorkflowStatus::Running);
        let started = Instant::now();
        tracing::info!(name = %workflow.name, "Workflow started");

        let result = match &workflow.chain {
            Chain::Sequential { steps } => self.run_sequential(&id, steps, &workflow.input, &token).await,
            Chain::Parallel { steps, step_timeout_ms } => {
                let limit = step_timeout_ms.map(Duration::from_millis);
                self.run_parallel(&id, steps, &workflow.input, limit, &token).await
            }
            Chain::Conditional {
                predicate,
                on_true,
                on_false,
            } => {
                if predicate.evaluate(&workflow.input) {
                    self.run_sequential(&id, on_true, &workflow.input, &token).await
                } else if let Some(on_false) = on_false {
                    self.run_sequential(&id, on_false, &workflow.input, &token).await
                } else {
                    tracing::debug!("Condition false and no else branch");
                    Ok(Outcome::passthrough(&workflow.input))
                }
            }
            Chain::Saga { steps } => self.run_saga(&id, steps, &workflow.input, &token).await,
        };

        self.running.write().await.remove(&id);
        let status = match &result {
            Ok(_) => WorkflowStatus::Completed,
            Err(OrchestratorError::Cancelled { .. }) => WorkflowStatus::Cancelled,
            Err(OrchestratorError::SagaStepFailed { .. }) => WorkflowStatus::Compensated,
            Err(_) => WorkflowStatus::Failed,
        };
        self.record_status(&id, status);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::info!(elapsed_ms, "Workflow completed"),
            Err(e) => tracing::warn!(elapsed_ms, status = ?status, "Workflow failed: {}", e),
        }

        result.map(|outcome| WorkflowResult {
            workflow_id: id,
            status,
            output: outcome.output,
            steps: outcome.steps,
            degraded: outcome.degraded,
        })
    }

    async fn run_sequential(
        &self,
        workflow_id: &str,
        steps: &[WorkflowStep],
        input: &Value,
        cancel: &CancellationToken,
    ) -> Result<Outcome, OrchestratorError> {
        let mut previous = input.clone();
        let mut records = Vec::with_capacity(steps.len());
        let mut degraded = false;

        for step in steps {
            if let Some(condition) = &step.condition {
                if !condition.evaluate(&previous) {
                    tracing::debug!(step = %step.name, "Condition false, skipping step");
                    records.push(StepRecord::skipped(&step.name));
                    continue;
                }
            }
            let step_input = step.resolve_input(&previous);
            let (result, record) = self.call_step(workflow_id, step, step_input, cancel).await?;
            degraded |= result.degraded;
            previous = result.value;
            records.push(record);
        }

        Ok(Outcome {
            output: previous,
            steps: records,
            degraded,
        })
    }

    async fn run_parallel(
        &self,
        workflow_id: &str,
        steps: &[WorkflowStep],
        input: &Value,
        step_timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Outcome, OrchestratorError> {
        let token = cancel.child_token();
        let semaphore = Semaphore::new(self.config.max_parallel.max(1));
        let mut records: Vec<Option<StepRecord>> = vec![None; steps.len()];
        let mut pending = FuturesUnordered::new();

        for (index, step) in steps.iter().enumerate() {
            if let Some(condition) = &step.condition {
                if !condition.evaluate(input) {
                    records[index] = Some(StepRecord::skipped(&step.name));
                    continue;
                }
            }
            let step_input = step.resolve_input(input);
            let token = &token;
            let semaphore = &semaphore;
            pending.push(async move {
                let _permit = semaphore.acquire().await.ok();
                let call = self.call_step(workflow_id, step, step_input, token);
                let result = match step_timeout {
                    Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                        Err(OrchestratorError::StepTimeout {
                            step: step.name.clone(),
                            timeout_ms: limit.as_millis() as u64,
                        })
                    }),
                    None => call.await,
                };
                (index, result)
            });
        }

        let mut outputs = serde_json::Map::new();
        let mut failures = Vec::new();
        let mut degraded = false;

        while let Some((index, result)) = pending.next().await {
            match result {
                Ok((value, record)) => {
                    degraded |= value.degraded;
                    outputs.insert(steps[index].name.clone(), value.value);
                    records[index] = Some(record);
                }
                Err(err @ OrchestratorError::StepTimeout { .. }) => {
                    tracing::warn!(step = %steps[index].name, "Parallel step timed out, cancelling siblings");
                    token.cancel();
                    return Err(err);
                }
                Err(err @ OrchestratorError::Cancelled { .. }) if cancel.is_cancelled() => {
                    token.cancel();
                    return Err(err);
                }
                Err(err) => failures.push((steps[index].name.clone(), err.to_string())),
            }
        }

        if !failures.is_empty() {
            return Err(OrchestratorError::ParallelStepsFailed { failures });
        }

        Ok(Outcome {
            output: Value::Object(outputs),
            steps: records.into_iter().flatten().collect(),
            degraded,
        })
    }

    async fn run_saga(
        &self,
        workflow_id: &str,
        steps: &[WorkflowStep],
        input: &Value,
        cancel: &CancellationToken,
    ) -> Result<Outcome, OrchestratorError> {
        let mut saga = SagaRecord::default();
        let mut previous = input.clone();
        let mut records = Vec::with_capacity(steps.len());
        let mut degraded = false;

        for step in steps {
            if let Some(condition) = &step.condition {
                if !condition.evaluate(&previous) {
                    records.push(StepRecord::skipped(&step.name));
                    continue;
                }
            }
            let step_input = step.resolve_input(&previous);
            match self.call_step(workflow_id, step, step_input.clone(), cancel).await {
                Ok((result, record)) => {
                    degraded |= result.degraded;
                    saga.completed.push(SagaEntry {
                        step: step.clone(),
                        input: step_input,
                        result: result.value.clone(),
                        served_by: result.served_by,
                    });
                    previous = result.value;
                    records.push(record);
                }
                Err(cause) => {
                    tracing::warn!(
                        step = %step.name,
                        completed = saga.completed.len(),
                        "Saga step failed, compensating: {}",
                        cause
                    );
                    let (compensated, compensation_failures) = self.compensate(&saga).await;
                    return Err(OrchestratorError::SagaStepFailed {
                        step: step.name.clone(),
                        cause: Box::new(cause),
                        compensated,
                        compensation_failures,
                    });
                }
            }
        }

        Ok(Outcome {
            output: previous,
            steps: records,
            degraded,
        })
    }

    /// 逆序补偿；在原步骤实际执行的组件上调用，补偿不受工作流取消影响
    async fn compensate(&self, saga: &SagaRecord) -> (Vec<String>, Vec<CompensationFailure>) {
        let token = CancellationToken::new();
        let mut compensated = Vec::new();
        let mut failures = Vec::new();

        for entry in saga.completed.iter().rev() {
            let Some(compensation) = &entry.step.compensation else {
                tracing::debug!(step = %entry.step.name, "No compensation declared");
                continue;
            };
            let input = compensation.input_for(&entry.input, &entry.result);
            let timeout = entry.step.timeout_duration().unwrap_or(self.config.step_timeout);
            match self
                .resilience
                .call(&entry.served_by, &compensation.operation, input, Some(timeout), &token)
                .await
            {
                Ok(_) => {
                    tracing::info!(step = %entry.step.name, component = %entry.served_by, "Step compensated");
                    compensated.push(entry.step.name.clone());
                }
                Err(e) => {
                    tracing::warn!(step = %entry.step.name, component = %entry.served_by, "Compensation failed: {}", e);
                    failures.push(CompensationFailure {
                        step: entry.step.name.clone(),
                        component: entry.served_by.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        (compensated, failures)
    }

    /// 执行单步：单目标直接调用，多目标走降级链
    async fn call_step(
        &self,
        workflow_id: &str,
        step: &WorkflowStep,
        input: Value,
        cancel: &CancellationToken,
    ) -> Result<(Degraded<Value>, StepRecord), OrchestratorError> {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled {
                workflow_id: workflow_id.to_string(),
            });
        }

        let started = Instant::now();
        let targets = step.targets();
        let timeout = Some(step.timeout_duration().unwrap_or(self.config.step_timeout));

        let result = if targets.len() == 1 {
            self.resilience
                .call(&step.target, &step.operation, input, timeout, cancel)
                .await
                .map(|value| Degraded::primary(value, step.target.clone()))
                .map_err(|e| match e {
                    CallError::Cancelled { .. } => OrchestratorError::Cancelled {
                        workflow_id: workflow_id.to_string(),
                    },
                    CallError::CircuitOpen { target, .. } => OrchestratorError::ComponentUnavailable {
                        component: target,
                        reason: "circuit open".to_string(),
                    },
                    other => OrchestratorError::RemoteCallFailed {
                        step: step.name.clone(),
                        source: other,
                    },
                })
        } else {
            self.resilience
                .call_with_fallbacks(&targets, &step.operation, &input, timeout, cancel)
                .await
                .map_err(|e| {
                    if cancel.is_cancelled() || e.was_cancelled() {
                        OrchestratorError::Cancelled {
                            workflow_id: workflow_id.to_string(),
                        }
                    } else {
                        OrchestratorError::from_exhausted(format!("step {}", step.name), e)
                    }
                })
        }?;

        let record = StepRecord {
            step: step.name.clone(),
            state: StepState::Completed,
            served_by: Some(result.served_by.clone()),
            degraded: result.degraded,
            output: Some(result.value.clone()),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::debug!(step = %step.name, served_by = %result.served_by, "Step completed");
        Ok((result, record))
    }

    fn record_status(&self, workflow_id: &str, status: WorkflowStatus) {
        let Some(store) = &self.store else {
            return;
        };
        let result = (|| {
            store.set_register(&status_key(workflow_id), json!(status))?;
            match status {
                WorkflowStatus::Created => {}
                WorkflowStatus::Running => store.add_to_set(ACTIVE_WORKFLOWS_KEY, workflow_id)?,
                WorkflowStatus::Completed => {
                    store.remove_from_set(ACTIVE_WORKFLOWS_KEY, workflow_id)?;
                    store.increment_counter(COMPLETED_WORKFLOWS_KEY, 1)?;
                }
                WorkflowStatus::Failed | WorkflowStatus::Compensated | WorkflowStatus::Cancelled => {
                    store.remove_from_set(ACTIVE_WORKFLOWS_KEY, workflow_id)?;
                    store.increment_counter(FAILED_WORKFLOWS_KEY, 1)?;
                }
            }
            Ok::<_, crate::state::StateError>(())
        })();
        if let Err(e) = result {
            tracing::warn!(workflow = workflow_id, "Failed to record workflow status: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{BreakerState, CircuitBreakerConfig, RetryPolicy};
    use crate::transport::{Envelope, FnResponder, InMemoryTransport};
    use crate::workflow::WorkflowBuilder;
    use std::sync::Mutex;

    type CallLog = Arc<Mutex<Vec<String>>>;

    async fn component(transport: &InMemoryTransport, name: &'static str, log: CallLog, fail_on: &'static [&'static str]) {
        transport
            .serve(
                name,
                Arc::new(FnResponder(move |env: Envelope| {
                    let log = Arc::clone(&log);
                    async move {
                        let op = env.payload["operation"].as_str().unwrap_or_default().to_string();
                        log.lock().unwrap().push(format!("{name}:{op}"));
                        if fail_on.contains(&op.as_str()) {
                            Err(format!("{op} failed"))
                        } else {
                            Ok(json!({"by": name, "op": op, "input": env.payload["input"]}))
                        }
                    }
                })),
            )
            .await;
    }

    fn engine(transport: Arc<InMemoryTransport>, store: Arc<StateStore>) -> WorkflowEngine {
        let resilience = ResilienceLayer::new(
            "orch",
            transport,
            CircuitBreakerConfig::default(),
            RetryPolicy::none(),
            Duration::from_secs(1),
        );
        WorkflowEngine::new(Arc::new(resilience), WorkflowConfig::default()).with_store(store)
    }

    #[tokio::test]
    async fn test_sequential_condition_and_transform() {
        let transport = Arc::new(InMemoryTransport::new());
        let log: CallLog = Arc::default();
        component(&transport, "a", Arc::clone(&log), &[]).await;
        let store = Arc::new(StateStore::new("orch"));
        let engine = engine(Arc::clone(&transport), Arc::clone(&store));

        let workflow = WorkflowBuilder::new("seq")
            .input(json!({"n": 1}))
            .step(WorkflowStep::new("first", "a", "one"))
            .step(WorkflowStep::new("skipped", "a", "never").when(Predicate::equals("/by", json!("b"))))
            .step(WorkflowStep::new("second", "a", "two").transform(Transform::Pointer { pointer: "/op".into() }))
            .build()
            .unwrap();
        let id = workflow.id.clone();

        let result = engine.execute(workflow, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.output["input"], json!("one"));
        assert_eq!(result.steps[1].state, StepState::Skipped);
        assert_eq!(*log.lock().unwrap(), vec!["a:one", "a:two"]);

        assert_eq!(store.get_register(&status_key(&id)).unwrap(), Some(json!("completed")));
        assert!(store.get_set(ACTIVE_WORKFLOWS_KEY).unwrap().is_empty());
        assert_eq!(store.get_counter(COMPLETED_WORKFLOWS_KEY).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_step_falls_back_to_next_component() {
        let transport = Arc::new(InMemoryTransport::new());
        let log: CallLog = Arc::default();
        component(&transport, "flaky", Arc::clone(&log), &["work"]).await;
        component(&transport, "backup", Arc::clone(&log), &[]).await;
        let engine = engine(Arc::clone(&transport), Arc::new(StateStore::new("orch")));

        let workflow = WorkflowBuilder::new("fallback")
            .step(WorkflowStep::new("work", "flaky", "work").fallback("backup"))
            .build()
            .unwrap();
        let result = engine.execute(workflow, &CancellationToken::new()).await.unwrap();
        assert!(result.degraded);
        assert_eq!(result.steps[0].served_by.as_deref(), Some("backup"));
    }

    #[tokio::test]
    async fn test_saga_compensates_in_reverse_order() {
        let transport = Arc::new(InMemoryTransport::new());
        let log: CallLog = Arc::default();
        component(&transport, "svc", Arc::clone(&log), &["s3"]).await;
        let store = Arc::new(StateStore::new("orch"));
        let engine = engine(Arc::clone(&transport), Arc::clone(&store));

        let workflow = WorkflowBuilder::new("saga")
            .saga()
            .step(WorkflowStep::new("one", "svc", "s1").compensate("undo1"))
            .step(WorkflowStep::new("two", "svc", "s2").compensate("undo2"))
            .step(WorkflowStep::new("three", "svc", "s3").compensate("undo3"))
            .step(WorkflowStep::new("four", "svc", "s4").compensate("undo4"))
            .build()
            .unwrap();

        let err = engine.execute(workflow, &CancellationToken::new()).await.unwrap_err();
        match err {
            OrchestratorError::SagaStepFailed {
                step,
                compensated,
                compensation_failures,
                ..
            } => {
                assert_eq!(step, "three");
                assert_eq!(compensated, vec!["two", "one"]);
                assert!(compensation_failures.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec!["svc:s1", "svc:s2", "svc:s3", "svc:undo2", "svc:undo1"]
        );
        assert_eq!(store.get_counter(FAILED_WORKFLOWS_KEY).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_compensation_failure_does_not_stop_others() {
        let transport = Arc::new(InMemoryTransport::new());
        let log: CallLog = Arc::default();
        component(&transport, "svc", Arc::clone(&log), &["s3", "undo2"]).await;
        let engine = engine(Arc::clone(&transport), Arc::new(StateStore::new("orch")));

        let workflow = WorkflowBuilder::new("saga")
            .saga()
            .step(WorkflowStep::new("one", "svc", "s1").compensate("undo1"))
            .step(WorkflowStep::new("two", "svc", "s2").compensate("undo2"))
            .step(WorkflowStep::new("three", "svc", "s3"))
            .build()
            .unwrap();

        let err = engine.execute(workflow, &CancellationToken::new()).await.unwrap_err();
        let OrchestratorError::SagaStepFailed {
            cause,
            compensated,
            compensation_failures,
            ..
        } = err
        else {
            panic!("expected saga failure");
        };
        assert!(matches!(*cause, OrchestratorError::RemoteCallFailed { ref step, .. } if step == "three"));
        assert_eq!(compensated, vec!["one"]);
        assert_eq!(compensation_failures.len(), 1);
        assert_eq!(compensation_failures[0].step, "two");
    }

    #[tokio::test]
    async fn test_parallel_joins_all_results() {
        let transport = Arc::new(InMemoryTransport::new());
        let log: CallLog = Arc::default();
        component(&transport, "a", Arc::clone(&log), &[]).await;
        component(&transport, "b", Arc::clone(&log), &[]).await;
        let engine = engine(Arc::clone(&transport), Arc::new(StateStore::new("orch")));

        let workflow = WorkflowBuilder::new("fan-out")
            .parallel()
            .input(json!({"x": 1}))
            .step(WorkflowStep::new("left", "a", "l"))
            .step(WorkflowStep::new("right", "b", "r"))
            .build()
            .unwrap();
        let result = engine.execute(workflow, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.output["left"]["by"], "a");
        assert_eq!(result.output["right"]["by"], "b");
        assert_eq!(result.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_parallel_timeout_cancels_siblings() {
        let transport = Arc::new(InMemoryTransport::new());
        transport
            .serve(
                "slow",
                Arc::new(FnResponder(|_env: Envelope| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!(null))
                })),
            )
            .await;
        let engine = engine(Arc::clone(&transport), Arc::new(StateStore::new("orch")));

        let workflow = WorkflowBuilder::new("timeout")
            .parallel()
            .step_timeout(Duration::from_millis(50))
            .step(WorkflowStep::new("one", "slow", "op"))
            .step(WorkflowStep::new("two", "slow", "op"))
            .build()
            .unwrap();
        let started = Instant::now();
        let err = engine.execute(workflow, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::StepTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_parallel_failures_are_aggregated() {
        let transport = Arc::new(InMemoryTransport::new());
        let log: CallLog = Arc::default();
        component(&transport, "a", Arc::clone(&log), &["bad"]).await;
        let engine = engine(Arc::clone(&transport), Arc::new(StateStore::new("orch")));

        let workflow = WorkflowBuilder::new("mixed")
            .parallel()
            .step(WorkflowStep::new("ok", "a", "good"))
            .step(WorkflowStep::new("broken", "a", "bad"))
            .build()
            .unwrap();
        let err = engine.execute(workflow, &CancellationToken::new()).await.unwrap_err();
        match err {
            OrchestratorError::ParallelStepsFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_conditional_branches() {
        let transport = Arc::new(InMemoryTransport::new());
        let log: CallLog = Arc::default();
        component(&transport, "a", Arc::clone(&log), &[]).await;
        let engine = engine(Arc::clone(&transport), Arc::new(StateStore::new("orch")));

        let build = |input: Value| {
            WorkflowBuilder::new("branch")
                .input(input)
                .conditional(Predicate::truthy("/fast"))
                .step(WorkflowStep::new("quick", "a", "quick"))
                .else_step(WorkflowStep::new("thorough", "a", "thorough"))
                .build()
                .unwrap()
        };
        engine.execute(build(json!({"fast": true})), &CancellationToken::new()).await.unwrap();
        engine.execute(build(json!({"fast": false})), &CancellationToken::new()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a:quick", "a:thorough"]);
    }

    #[tokio::test]
    async fn test_cancelled_workflow() {
        let transport = Arc::new(InMemoryTransport::new());
        let log: CallLog = Arc::default();
        component(&transport, "a", Arc::clone(&log), &[]).await;
        let engine = engine(Arc::clone(&transport), Arc::new(StateStore::new("orch")));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let workflow = WorkflowBuilder::new("cancelled")
            .step(WorkflowStep::new("one", "a", "op"))
            .build()
            .unwrap();
        let err = engine.execute(workflow, &cancel).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled { .. }));
        assert!(log.lock().unwrap().is_empty());
        assert!(engine.running().await.is_empty());
    }

    /// 0 正常返回，1 报错，2 长时间不返回
    async fn scripted(transport: &InMemoryTransport, name: &'static str, mode: Arc<std::sync::atomic::AtomicU8>) {
        transport
            .serve(
                name,
                Arc::new(FnResponder(move |_env: Envelope| {
                    let mode = Arc::clone(&mode);
                    async move {
                        match mode.load(std::sync::atomic::Ordering::SeqCst) {
                            0 => Ok(json!({"by": name})),
                            1 => Err(format!("{name} failed")),
                            _ => {
                                tokio::time::sleep(Duration::from_secs(10)).await;
                                Ok(json!(null))
                            }
                        }
                    }
                })),
            )
            .await;
    }

    fn engine_with_breaker(transport: Arc<InMemoryTransport>, store: Arc<StateStore>, breaker: CircuitBreakerConfig) -> WorkflowEngine {
        let resilience = ResilienceLayer::new("orch", transport, breaker, RetryPolicy::none(), Duration::from_secs(20));
        WorkflowEngine::new(Arc::new(resilience), WorkflowConfig::default()).with_store(store)
    }

    #[tokio::test]
    async fn test_parallel_timeout_during_half_open_does_not_wedge_breaker() {
        use std::sync::atomic::{AtomicU8, Ordering};

        let transport = Arc::new(InMemoryTransport::new());
        let mode = Arc::new(AtomicU8::new(1));
        scripted(&transport, "svc", Arc::clone(&mode)).await;
        let engine = engine_with_breaker(
            Arc::clone(&transport),
            Arc::new(StateStore::new("orch")),
            CircuitBreakerConfig {
                failure_threshold: 1,
                timeout: Duration::from_millis(50),
                half_open_retries: 1,
            },
        );
        let single = |name: &str| {
            WorkflowBuilder::new(name)
                .step(WorkflowStep::new("call", "svc", "op"))
                .build()
                .unwrap()
        };

        engine.execute(single("trip"), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(engine.resilience.breaker_state("svc"), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        mode.store(2, Ordering::SeqCst);
        let slow = WorkflowBuilder::new("slow")
            .parallel()
            .step_timeout(Duration::from_millis(20))
            .step(WorkflowStep::new("call", "svc", "op"))
            .build()
            .unwrap();
        let err = engine.execute(slow, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::StepTimeout { .. }));
        assert_eq!(engine.resilience.breaker_state("svc"), BreakerState::HalfOpen);

        // 超时的试探调用已归还名额，下一次试探成功即闭合
        mode.store(0, Ordering::SeqCst);
        let result = engine.execute(single("recover"), &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(engine.resilience.breaker_state("svc"), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_all_parallel_steps() {
        use std::sync::atomic::AtomicU8;

        let transport = Arc::new(InMemoryTransport::new());
        scripted(&transport, "left", Arc::new(AtomicU8::new(2))).await;
        scripted(&transport, "right", Arc::new(AtomicU8::new(2))).await;
        let store = Arc::new(StateStore::new("orch"));
        let engine = Arc::new(engine_with_breaker(
            Arc::clone(&transport),
            Arc::clone(&store),
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            },
        ));

        let workflow = WorkflowBuilder::new("fan-out")
            .id("wf-fan-out")
            .parallel()
            .step(WorkflowStep::new("left", "left", "wait"))
            .step(WorkflowStep::new("right", "right", "wait"))
            .build()
            .unwrap();
        let running = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.execute(workflow, &CancellationToken::new()).await })
        };
        for _ in 0..100 {
            if !engine.running().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // 两个调用都已发出
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        assert!(engine.cancel("wf-fan-out").await);
        let err = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(engine.resilience.breaker_state("left"), BreakerState::Closed);
        assert_eq!(engine.resilience.breaker_state("right"), BreakerState::Closed);
        assert_eq!(store.get_register(&status_key("wf-fan-out")).unwrap(), Some(json!("cancelled")));
        assert!(store.get_set(ACTIVE_WORKFLOWS_KEY).unwrap().is_empty());
    }
}
