//! 组件健康监控
//!
//! 每个周期：
//! 1. 清理心跳过期的组件（从注册表移除）
//! 2. 并发调用各组件的 `getStatus` RPC；连续失败达到阈值后标记为 down，恢复应答后按应答更新
//!
//! 未暴露 `getStatus` 的组件只靠心跳维持，不计为轮询失败。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::routing::{ComponentRegistry, HealthSnapshot, HealthStatus};
use crate::transport::{MessageTransport, TransportError};

pub const STATUS_METHOD: &str = "getStatus";

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub interval: Duration,
    pub poll_timeout: Duration,
    pub failure_threshold: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(2),
            failure_threshold: 3,
        }
    }
}

/// 单个周期的结果
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HealthReport {
    pub expired: Vec<String>,
    pub marked_down: Vec<String>,
    pub recovered: Vec<String>,
}

enum PollOutcome {
    Status(HealthSnapshot),
    Unsupported,
    Failed(String),
}

pub struct HealthMonitor {
    registry: Arc<ComponentRegistry>,
    transport: Arc<dyn MessageTransport>,
    config: HealthMonitorConfig,
    failures: Mutex<HashMap<String, u32>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ComponentRegistry>,
        transport: Arc<dyn MessageTransport>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// 启动周期任务，取消 token 后退出
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Health monitor stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        self.run_once().await;
                    }
                }
            }
        })
    }

    /// 执行一个检查周期
    pub async fn run_once(&self) -> HealthReport {
        let mut report = HealthReport {
            expired: self.registry.sweep_expired(chrono::Utc::now()).await,
            ..HealthReport::default()
        };
        if !report.expired.is_empty() {
            let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            for id in &report.expired {
                failures.remove(id);
            }
        }

        let components = self.registry.snapshot().await;
        // 已注销的组件不再保留失败计数
        {
            let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            failures.retain(|id, _| components.iter().any(|record| &record.id == id));
        }

        let polls = components.into_iter().map(|record| async move {
            let outcome = self.poll(&record.id).await;
            (record, outcome)
        });

        for (record, outcome) in join_all(polls).await {
            match outcome {
                PollOutcome::Unsupported => {}
                PollOutcome::Status(snapshot) => {
                    self.failures
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&record.id);
                    if record.is_down() && snapshot.status != HealthStatus::Down {
                        tracing::info!(component = %record.id, "Component recovered");
                        report.recovered.push(record.id.clone());
                    }
                    self.registry.update_health(&record.id, snapshot).await;
                }
                PollOutcome::Failed(error) => {
                    let count = {
                        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
                        let count = failures.entry(record.id.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    tracing::debug!(component = %record.id, failures = count, "Status poll failed: {}", error);
                    if count >= self.config.failure_threshold && !record.is_down() {
                        tracing::warn!(component = %record.id, failures = count, "Marking component down");
                        self.registry.update_health(&record.id, HealthSnapshot::down()).await;
                        report.marked_down.push(record.id.clone());
                    }
                }
            }
        }

        report
    }

    /// 组件当前的连续轮询失败次数
    pub fn failure_count(&self, id: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    async fn poll(&self, id: &str) -> PollOutcome {
        let call = self.transport.call_rpc(id, STATUS_METHOD, json!({}));
        match tokio::time::timeout(self.config.poll_timeout, call).await {
            Err(_) => PollOutcome::Failed(format!("timed out after {}ms", self.config.poll_timeout.as_millis())),
            Ok(Err(TransportError::UnknownMethod(_))) => PollOutcome::Unsupported,
            Ok(Err(e)) => PollOutcome::Failed(e.to_string()),
            Ok(Ok(reply)) => match serde_json::from_value::<HealthSnapshot>(reply) {
                Ok(snapshot) => PollOutcome::Status(snapshot),
                Err(e) => PollOutcome::Failed(format!("malformed status: {e}")),
            },
        }
    }
}
