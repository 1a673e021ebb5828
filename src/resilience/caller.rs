//! 组合熔断 + 重试 + 降级的远程调用入口
//!
//! 调用结果同时记入：
//! - 本地滑动窗口（最近 N 次成功率，供匹配器计算可用性）
//! - 状态存储中的 `calls/<target>/ok|err` 计数器（跨实例可见）
//! - 熔断迁移写入 `breaker/<caller>/<target>` 寄存器

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::circuit_breaker::{BreakerRegistry, BreakerState, CircuitBreakerConfig, Transition};
use super::degradation::{Degraded, FallbackExhausted, GracefulDegradation};
use super::retry::RetryPolicy;
use super::CallError;
use crate::state::StateStore;
use crate::transport::MessageTransport;

const DEFAULT_WINDOW: usize = 20;

pub fn ok_counter_key(target: &str) -> String {
    format!("calls/{target}/ok")
}

pub fn err_counter_key(target: &str) -> String {
    format!("calls/{target}/err")
}

pub fn breaker_key(caller: &str, target: &str) -> String {
    format!("breaker/{caller}/{target}")
}

pub struct ResilienceLayer {
    caller_id: String,
    transport: Arc<dyn MessageTransport>,
    breakers: BreakerRegistry,
    retry: RetryPolicy,
    default_timeout: Duration,
    window: usize,
    outcomes: Mutex<HashMap<String, VecDeque<bool>>>,
    store: Option<Arc<StateStore>>,
}

impl ResilienceLayer {
    pub fn new(
        caller_id: impl Into<String>,
        transport: Arc<dyn MessageTransport>,
        breaker: CircuitBreakerConfig,
        retry: RetryPolicy,
        default_timeout: Duration,
    ) -> Self {
        Self {
            caller_id: caller_id.into(),
            transport,
            breakers: BreakerRegistry::new(breaker),
            retry,
            default_timeout,
            window: DEFAULT_WINDOW,
            outcomes: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn breaker_state(&self, target: &str) -> BreakerState {
        self.breakers
            .get(&self.caller_id, target)
            .map(|b| b.state())
            .unwrap_or(BreakerState::Closed)
    }

    /// 调用单个目标：熔断检查 + 重试
    pub async fn call(
        &self,
        target: &str,
        operation: &str,
        input: Value,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Value, CallError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let payload = json!({
            "operation": operation,
            "input": input,
            "caller": self.caller_id,
        });
        self.retry
            .execute(cancel, |_| self.attempt(target, payload.clone(), timeout, cancel))
            .await
    }

    /// 依次调用目标列表，第一个为主目标，其余为备选
    pub async fn call_with_fallbacks(
        &self,
        targets: &[String],
        operation: &str,
        input: &Value,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Degraded<Value>, FallbackExhausted> {
        let Some((primary, rest)) = targets.split_first() else {
            return Err(FallbackExhausted {
                primary: String::new(),
                failures: Vec::new(),
            });
        };

        let mut chain = GracefulDegradation::new(primary.clone(), move || {
            self.call(primary, operation, input.clone(), timeout, cancel).boxed()
        });
        for target in rest {
            chain = chain.fallback(target.clone(), move || {
                self.call(target, operation, input.clone(), timeout, cancel).boxed()
            });
        }
        chain.run().await
    }

    async fn attempt(
        &self,
        target: &str,
        payload: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, CallError> {
        let breaker = self.breakers.get_or_create(&self.caller_id, target);
        let permit = match breaker.acquire() {
            Ok((permit, transition)) => {
                self.apply_transition(target, transition);
                permit
            }
            Err(rejected) => {
                return Err(CallError::CircuitOpen {
                    target: target.to_string(),
                    retry_in_ms: rejected.retry_in.as_millis() as u64,
                });
            }
        };

        // 取消或外层超时 drop 本 future 时，permit 随之归还试探名额
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(CallError::Cancelled { target: target.to_string() });
            }
            reply = self.transport.request(target, payload, timeout) => {
                reply.map_err(|e| CallError::from_transport(target, e))
            }
        };

        let transition = match &result {
            Ok(_) => permit.succeed(),
            Err(_) => permit.fail(),
        };
        self.apply_transition(target, transition);
        self.record_outcome(target, result.is_ok());
        result
    }

    fn apply_transition(&self, target: &str, transition: Option<Transition>) {
        let Some(transition) = transition else {
            return;
        };
        match transition.to {
            BreakerState::Open => tracing::warn!(
                caller = %self.caller_id,
                target_component = target,
                "Circuit opened ({} -> {})",
                transition.from,
                transition.to
            ),
            _ => tracing::info!(
                caller = %self.caller_id,
                target_component = target,
                "Circuit {} -> {}",
                transition.from,
                transition.to
            ),
        }
        if let Some(store) = &self.store {
            let value = json!({
                "state": transition.to,
                "at": chrono::Utc::now().timestamp_millis(),
            });
            if let Err(e) = store.set_register(&breaker_key(&self.caller_id, target), value) {
                tracing::warn!("Failed to record breaker state: {}", e);
            }
        }
    }

    fn record_outcome(&self, target: &str, ok: bool) {
        {
            let mut outcomes = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
            let window = outcomes.entry(target.to_string()).or_default();
            window.push_back(ok);
            while window.len() > self.window {
                window.pop_front();
            }
        }
        if let Some(store) = &self.store {
            let key = if ok { ok_counter_key(target) } else { err_counter_key(target) };
            if let Err(e) = store.increment_counter(&key, 1) {
                tracing::warn!("Failed to record call outcome: {}", e);
            }
        }
    }

    /// 本实例最近窗口内的成功率；没有调用记录时为 None
    pub fn local_availability(&self, target: &str) -> Option<f64> {
        let outcomes = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
        let window = outcomes.get(target).filter(|w| !w.is_empty())?;
        let ok = window.iter().filter(|&&o| o).count();
        Some(ok as f64 / window.len() as f64)
    }

    /// 跨实例累计成功率（来自状态存储）
    pub fn replicated_availability(&self, target: &str) -> Option<f64> {
        let store = self.store.as_ref()?;
        let ok = store.get_counter(&ok_counter_key(target)).ok()?;
        let err = store.get_counter(&err_counter_key(target)).ok()?;
        let total = ok + err;
        (total > 0).then(|| ok as f64 / total as f64)
    }

    /// 可用性 ∈ [0, 1]：本地窗口优先，其次复制计数，均无记录视为 1.0
    pub fn availability(&self, target: &str) -> f64 {
        self.local_availability(target)
            .or_else(|| self.replicated_availability(target))
            .unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Envelope, FnResponder, InMemoryTransport};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn layer(transport: Arc<InMemoryTransport>, threshold: u32, retries: u32) -> ResilienceLayer {
        ResilienceLayer::new(
            "orch",
            transport,
            CircuitBreakerConfig {
                failure_threshold: threshold,
                timeout: Duration::from_secs(60),
                half_open_retries: 1,
            },
            RetryPolicy {
                max_retries: retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                ..RetryPolicy::default()
            },
            Duration::from_millis(200),
        )
    }

    async fn failing(transport: &InMemoryTransport, name: &str, hits: Arc<AtomicU32>) {
        transport
            .serve(
                name,
                Arc::new(FnResponder(move |_env: Envelope| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Err::<Value, _>("boom".to_string())
                    }
                })),
            )
            .await;
    }

    #[tokio::test]
    async fn test_open_breaker_stops_reaching_target() {
        let transport = Arc::new(InMemoryTransport::new());
        let hits = Arc::new(AtomicU32::new(0));
        failing(&transport, "db", Arc::clone(&hits)).await;
        let layer = layer(Arc::clone(&transport), 3, 0);
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            let err = layer.call("db", "query", json!({}), None, &cancel).await.unwrap_err();
            assert!(matches!(err, CallError::Remote { .. }));
        }
        assert_eq!(layer.breaker_state("db"), BreakerState::Open);

        let err = layer.call("db", "query", json!({}), None, &cancel).await.unwrap_err();
        assert!(matches!(err, CallError::CircuitOpen { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(layer.availability("db"), 0.0);
    }

    #[tokio::test]
    async fn test_fallback_serves_when_primary_fails() {
        let transport = Arc::new(InMemoryTransport::new());
        failing(&transport, "primary", Arc::new(AtomicU32::new(0))).await;
        transport
            .serve(
                "backup",
                Arc::new(FnResponder(|env: Envelope| async move { Ok(json!({"op": env.payload["operation"]})) })),
            )
            .await;
        let layer = layer(Arc::clone(&transport), 5, 1);

        let result = layer
            .call_with_fallbacks(
                &["primary".to_string(), "backup".to_string()],
                "build",
                &json!({}),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.degraded);
        assert_eq!(result.served_by, "backup");
        assert_eq!(result.value["op"], "build");
    }

    #[tokio::test]
    async fn test_outcomes_recorded_in_store() {
        let transport = Arc::new(InMemoryTransport::new());
        transport
            .serve("ok", Arc::new(FnResponder(|_env: Envelope| async { Ok(json!(1)) })))
            .await;
        let store = Arc::new(StateStore::new("orch"));
        let layer = layer(Arc::clone(&transport), 5, 0).with_store(Arc::clone(&store));

        layer
            .call("ok", "ping", json!(null), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.get_counter(&ok_counter_key("ok")).unwrap(), 1);
        assert_eq!(layer.availability("ok"), 1.0);
        assert_eq!(layer.availability("never-called"), 1.0);
    }

    #[tokio::test]
    async fn test_replicated_availability_used_without_local_history() {
        let transport = Arc::new(InMemoryTransport::new());
        let store = Arc::new(StateStore::new("orch"));
        store.increment_counter(&ok_counter_key("db"), 3).unwrap();
        store.increment_counter(&err_counter_key("db"), 1).unwrap();
        let layer = layer(transport, 5, 0).with_store(store);
        assert_eq!(layer.local_availability("db"), None);
        assert_eq!(layer.availability("db"), 0.75);
    }
}
