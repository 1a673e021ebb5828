//! 路由历史：最近的决策与执行结果（有界），以及写入状态存储的按组件路由计数
//!
//! 计数器 `routes/<component>` 为 GCounter，各实例合并后即为全局路由次数。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::routing::{ExecutionStrategy, RoutingDecision};
use crate::state::StateStore;

pub fn route_counter_key(component: &str) -> String {
    format!("routes/{component}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOutcome {
    /// 已决策，尚未执行或只做了路由
    Decided,
    Succeeded,
    /// 由备选组件完成
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteRecord {
    pub request_id: String,
    pub primary: String,
    pub components: Vec<String>,
    pub strategy: ExecutionStrategy,
    pub outcome: RouteOutcome,
    pub error: Option<String>,
    pub decided_at: i64,
}

pub struct RoutingHistory {
    capacity: usize,
    records: Mutex<VecDeque<RouteRecord>>,
    store: Option<Arc<StateStore>>,
}

impl RoutingHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 记录一次决策并累加参与组件的路由计数
    pub fn record_decision(&self, decision: &RoutingDecision) {
        let components: Vec<String> = match &decision.collaboration {
            Some(plan) => plan.components().into_iter().map(str::to_string).collect(),
            None => vec![decision.primary.clone()],
        };

        if let Some(store) = &self.store {
            for component in &components {
                if let Err(e) = store.increment_counter(&route_counter_key(component), 1) {
                    tracing::warn!(component = %component, "Failed to record route: {}", e);
                }
            }
        }

        let record = RouteRecord {
            request_id: decision.request_id.clone(),
            primary: decision.primary.clone(),
            components,
            strategy: decision.strategy,
            outcome: RouteOutcome::Decided,
            error: None,
            decided_at: chrono::Utc::now().timestamp_millis(),
        };

        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
    }

    /// 更新执行结果；记录已被淘汰时返回 false
    pub fn record_outcome(&self, request_id: &str, outcome: RouteOutcome, error: Option<String>) -> bool {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.iter_mut().rev().find(|r| r.request_id == request_id) {
            Some(record) => {
                record.outcome = outcome;
                record.error = error;
                true
            }
            None => false,
        }
    }

    /// 最近 `n` 条，从新到旧
    pub fn recent(&self, n: usize) -> Vec<RouteRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 组件的全局路由次数（合并后的计数器）
    pub fn route_count(&self, component: &str) -> u64 {
        self.store
            .as_ref()
            .and_then(|s| s.get_counter(&route_counter_key(component)).ok())
            .unwrap_or(0)
    }
}
