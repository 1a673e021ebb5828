//! 编排器构建器：统一的实例初始化逻辑
//!
//! 由 `AppConfig` 派生各模块的运行时配置，并注入传输层与状态存储；
//! 未指定传输层时使用进程内传输。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::error::OrchestratorError;
use crate::core::health::{HealthMonitor, HealthMonitorConfig};
use crate::core::history::RoutingHistory;
use crate::core::orchestrator::Orchestrator;
use crate::resilience::{CircuitBreakerConfig, ResilienceLayer, RetryPolicy};
use crate::routing::{
    CapabilityMatcher, ClassifierConfig, ComponentRegistry, DecisionConfig, DecisionEngine, MatcherConfig,
    RequestClassifier,
};
use crate::state::{StateStore, StateSync};
use crate::transport::{InMemoryTransport, MessageTransport};
use crate::workflow::{WorkflowConfig, WorkflowEngine};

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    transport: Option<Arc<dyn MessageTransport>>,
    store: Option<Arc<StateStore>>,
}

impl OrchestratorBuilder {
    /// 创建新的构建器
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            transport: None,
            store: None,
        }
    }

    /// 设置消息传输层
    pub fn with_transport(mut self, transport: Arc<dyn MessageTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 使用已有的状态存储（其副本 ID 即实例 ID）
    pub fn with_store(mut self, store: Arc<StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 构建编排器，并加载配置中的静态组件清单
    pub async fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(StateStore::new(config.orchestrator.instance_id())));
        let instance_id = store.replica_id().to_string();
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(InMemoryTransport::new()) as Arc<dyn MessageTransport>);

        let registry = Arc::new(ComponentRegistry::new(Duration::from_secs(
            config.registry.heartbeat_timeout_secs,
        )));
        for manifest in config.components.iter().cloned() {
            registry.register(manifest).await;
        }
        if let Some(path) = &config.orchestrator.manifest_path {
            let count = registry.load_manifests(path).await?;
            tracing::info!(path = %path.display(), count, "Loaded component manifests");
        }

        let resilience = Arc::new(
            ResilienceLayer::new(
                instance_id.clone(),
                Arc::clone(&transport),
                CircuitBreakerConfig::from(&config.circuit_breaker),
                RetryPolicy::from(&config.retry),
                Duration::from_millis(config.orchestrator.request_timeout_ms),
            )
            .with_store(Arc::clone(&store))
            .with_window(config.matcher.availability_window),
        );

        let workflows = WorkflowEngine::new(Arc::clone(&resilience), WorkflowConfig::from(&config.workflow))
            .with_store(Arc::clone(&store));

        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            HealthMonitorConfig {
                interval: Duration::from_secs(config.registry.health_poll_interval_secs.max(1)),
                failure_threshold: config.registry.health_failure_threshold.max(1),
                ..HealthMonitorConfig::default()
            },
        ));

        tracing::debug!(instance = %instance_id, components = config.components.len(), "Orchestrator built");

        Ok(Orchestrator {
            instance_id,
            classifier: RequestClassifier::new(ClassifierConfig::from(&config.classifier)),
            matcher: CapabilityMatcher::new(MatcherConfig::from(&config.matcher)),
            decisions: DecisionEngine::new(DecisionConfig::from(&config.routing)),
            history: RoutingHistory::new(config.orchestrator.history_capacity).with_store(Arc::clone(&store)),
            sync: StateSync::new(Arc::clone(&store), Arc::clone(&transport))
                .with_timeout(Duration::from_millis(config.orchestrator.request_timeout_ms)),
            transport,
            store,
            registry,
            resilience,
            workflows,
            monitor,
        })
    }
}
