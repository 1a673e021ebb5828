//! 编排器实例：分类 -> 匹配 -> 决策 -> 生成工作流 -> 弹性执行
//!
//! 所有协作者在构建时注入（见 `OrchestratorBuilder`），实例之间只通过消息传输与状态同步交互。

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::OrchestratorError;
use crate::core::health::HealthMonitor;
use crate::core::history::{RouteOutcome, RoutingHistory};
use crate::core::membership::MembershipListener;
use crate::resilience::{BreakerSnapshot, ResilienceLayer};
use crate::routing::{
    CapabilityMatcher, Classification, ComponentManifest, ComponentRecord, ComponentRegistry, DecisionEngine,
    DependencyMap, RequestClassifier, RoutingDecision, RoutingRequest,
};
use crate::state::{StateStore, StateSync};
use crate::transport::MessageTransport;
use crate::workflow::{plan_from_decision, Workflow, WorkflowEngine, WorkflowResult};
use crate::workflow::engine::ACTIVE_WORKFLOWS_KEY;

/// 实例状态概览
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub instance_id: String,
    pub components: Vec<ComponentRecord>,
    pub active_workflows: Vec<String>,
    pub breakers: Vec<BreakerSnapshot>,
    pub recent_routes: usize,
}

pub struct Orchestrator {
    pub(crate) instance_id: String,
    pub(crate) transport: Arc<dyn MessageTransport>,
    pub(crate) store: Arc<StateStore>,
    pub(crate) registry: Arc<ComponentRegistry>,
    pub(crate) classifier: RequestClassifier,
    pub(crate) matcher: CapabilityMatcher,
    pub(crate) decisions: DecisionEngine,
    pub(crate) resilience: Arc<ResilienceLayer>,
    pub(crate) workflows: WorkflowEngine,
    pub(crate) history: RoutingHistory,
    pub(crate) sync: StateSync,
    pub(crate) monitor: Arc<HealthMonitor>,
}

impl Orchestrator {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn resilience(&self) -> &Arc<ResilienceLayer> {
        &self.resilience
    }

    pub fn workflows(&self) -> &WorkflowEngine {
        &self.workflows
    }

    pub fn history(&self) -> &RoutingHistory {
        &self.history
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn sync(&self) -> &StateSync {
        &self.sync
    }

    /// 启动后台服务：状态同步、成员监听、健康监控；返回健康监控任务句柄
    pub async fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<()>, OrchestratorError> {
        self.sync.start(cancel.clone()).await?;
        MembershipListener::new(Arc::clone(&self.registry))
            .start(self.transport.as_ref())
            .await?;
        let handle = Arc::clone(&self.monitor).spawn(cancel);
        tracing::info!(instance = %self.instance_id, "Orchestrator started");
        Ok(handle)
    }

    /// 本地注册组件（静态清单或测试）
    pub async fn register_component(&self, manifest: ComponentManifest) -> bool {
        self.registry.register(manifest).await
    }

    pub fn classify(&self, request: &RoutingRequest) -> Classification {
        self.classifier.classify(request)
    }

    /// 分类并做出路由决策（不执行）
    pub async fn route(&self, request: &RoutingRequest) -> Result<(Classification, RoutingDecision), OrchestratorError> {
        let classification = self.classifier.classify(request);
        let components = self.registry.snapshot().await;
        let scores = self.matcher.score(
            &classification,
            &components,
            self.resilience.as_ref(),
            request.origin.as_deref(),
        );

        let mut declared = DependencyMap::new();
        for record in &components {
            for (domain, on) in &record.routing.domain_dependencies {
                declared.entry(domain.clone()).or_default().extend(on.iter().cloned());
            }
        }

        let mut decision = match self.decisions.decide_with(&classification, &scores, &declared) {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(domains = ?classification.domains, candidates = components.len(), "Routing failed: {}", e);
                return Err(e.into());
            }
        };
        if let Some(id) = &request.id {
            decision.request_id = id.clone();
        }

        tracing::info!(
            request = %decision.request_id,
            primary = %decision.primary,
            strategy = ?decision.strategy,
            fallbacks = decision.fallbacks.len(),
            "Routing decision"
        );
        self.history.record_decision(&decision);
        Ok((classification, decision))
    }

    /// 路由并执行
    pub async fn handle(
        &self,
        request: &RoutingRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResult, OrchestratorError> {
        let (_, decision) = self.route(request).await?;
        let workflow = plan_from_decision(&decision, request)?;
        let result = self.workflows.execute(workflow, cancel).await;

        match &result {
            Ok(r) if r.degraded => self.history.record_outcome(&decision.request_id, RouteOutcome::Degraded, None),
            Ok(_) => self.history.record_outcome(&decision.request_id, RouteOutcome::Succeeded, None),
            Err(e) => self
                .history
                .record_outcome(&decision.request_id, RouteOutcome::Failed, Some(e.to_string())),
        };
        result
    }

    /// 执行调用方自行构建的工作流
    pub async fn execute(&self, workflow: Workflow, cancel: &CancellationToken) -> Result<WorkflowResult, OrchestratorError> {
        self.workflows.execute(workflow, cancel).await
    }

    pub async fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            instance_id: self.instance_id.clone(),
            components: self.registry.snapshot().await,
            active_workflows: self
                .store
                .get_set(ACTIVE_WORKFLOWS_KEY)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default(),
            breakers: self.resilience.breakers().snapshot(),
            recent_routes: self.history.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::builder::OrchestratorBuilder;
    use crate::routing::ExecutionStrategy;
    use crate::transport::{Envelope, FnResponder, InMemoryTransport};
    use serde_json::json;

    async fn orchestrator(transport: Arc<InMemoryTransport>) -> Orchestrator {
        let mut config = AppConfig::default();
        config.orchestrator.instance_id = Some("orch-test".into());
        config.retry.max_retries = 0;
        OrchestratorBuilder::new(config)
            .with_transport(transport)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_route_prefers_declared_capability() {
        let transport = Arc::new(InMemoryTransport::new());
        let orch = orchestrator(transport).await;
        orch.register_component(ComponentManifest::new("api-agent").domains(["backend"]).patterns(["rest"]))
            .await;
        orch.register_component(ComponentManifest::new("ui-agent").domains(["frontend"])).await;

        let mut request = RoutingRequest::new("Add a REST endpoint for user login").with_files(["src/api/users.ts"]);
        request.id = Some("req-1".into());
        let (classification, decision) = orch.route(&request).await.unwrap();

        assert_eq!(classification.domains[0].to_string(), "backend");
        assert_eq!(decision.primary, "api-agent");
        assert_eq!(decision.request_id, "req-1");
        assert_eq!(decision.strategy, ExecutionStrategy::Single);
        assert_eq!(orch.history().len(), 1);
    }

    #[tokio::test]
    async fn test_route_without_components_fails() {
        let orch = orchestrator(Arc::new(InMemoryTransport::new())).await;
        let err = orch.route(&RoutingRequest::new("anything")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoCapableComponent { .. }));
    }

    #[tokio::test]
    async fn test_handle_executes_and_records_outcome() {
        let transport = Arc::new(InMemoryTransport::new());
        transport
            .serve(
                "api-agent",
                Arc::new(FnResponder(|env: Envelope| async move { Ok(json!({"done": env.payload["operation"]})) })),
            )
            .await;
        let orch = orchestrator(Arc::clone(&transport)).await;
        orch.register_component(ComponentManifest::new("api-agent").domains(["backend"])).await;

        let mut request = RoutingRequest::new("fix the api server bug");
        request.operation = Some("fix".into());
        let result = orch.handle(&request, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.output, json!({"done": "fix"}));
        assert_eq!(orch.history().recent(1)[0].outcome, RouteOutcome::Succeeded);
        assert_eq!(orch.history().route_count("api-agent"), 1);

        let status = orch.status().await;
        assert_eq!(status.instance_id, "orch-test");
        assert!(status.active_workflows.is_empty());
        assert_eq!(status.components.len(), 1);
    }
}
