//! 进程内传输实现
//!
//! - 每个订阅拥有独立的投递队列和消费任务：同一订阅内按发布顺序处理，发布方不会重入处理器。
//! - 请求以 correlation id 挂起在 pending 表中，应答或超时后移除；调用方 future 被丢弃时同样移除。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};

use super::{
    rpc_name, Envelope, MessageHandler, MessageTransport, RequestHandler, RpcHandler, SubscriptionId,
    TransportError,
};

type Reply = Result<serde_json::Value, TransportError>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>;

struct Subscription {
    pattern: glob::Pattern,
    queue: mpsc::UnboundedSender<Envelope>,
}

/// 进程内消息总线
#[derive(Default)]
pub struct InMemoryTransport {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    responders: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    rpc_methods: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
    pending: PendingMap,
    next_subscription: AtomicU64,
}

/// 请求 future 结束（应答、超时或被丢弃）时清理 pending 项
struct PendingGuard {
    pending: PendingMap,
    correlation_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.correlation_id);
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册目的地的请求处理器（组件接入点）
    pub async fn serve(&self, destination: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.responders.write().await.insert(destination.into(), handler);
    }

    /// 移除目的地（模拟组件下线）
    pub async fn unserve(&self, destination: &str) {
        self.responders.write().await.remove(destination);
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    fn complete(&self, correlation_id: &str, reply: Reply) -> Result<(), TransportError> {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(correlation_id)
            .ok_or_else(|| TransportError::UnknownCorrelation(correlation_id.to_string()))?;
        // 请求方已放弃时接收端已关闭，忽略
        let _ = sender.send(reply);
        Ok(())
    }
}

#[async_trait]
impl MessageTransport for InMemoryTransport {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), TransportError> {
        let envelope = Envelope::new(topic, payload);
        let subscriptions = self.subscriptions.read().await;
        let mut delivered = 0usize;
        for sub in subscriptions.values() {
            if sub.pattern.matches(topic) && sub.queue.send(envelope.clone()).is_ok() {
                delivered += 1;
            }
        }
        tracing::trace!(topic, delivered, "Published message");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic_pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId, TransportError> {
        let pattern = glob::Pattern::new(topic_pattern)
            .map_err(|e| TransportError::InvalidPattern(format!("{topic_pattern}: {e}")))?;
        let (queue, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed) + 1;

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                handler.handle(envelope).await;
            }
        });

        self.subscriptions
            .write()
            .await
            .insert(id, Subscription { pattern, queue });
        tracing::debug!(id, pattern = topic_pattern, "Subscribed");
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        // 丢弃发送端后消费任务自然退出
        self.subscriptions.write().await.remove(&id);
        Ok(())
    }

    async fn request(
        &self,
        destination: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError> {
        let handler = self
            .responders
            .read()
            .await
            .get(destination)
            .cloned()
            .ok_or_else(|| TransportError::NoRoute(destination.to_string()))?;

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(correlation_id.clone(), tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            correlation_id: correlation_id.clone(),
        };

        let envelope = Envelope::new(destination, payload).with_correlation(correlation_id.clone());
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            let reply = match handler.handle(envelope).await {
                Ok(Some(value)) => Some(Ok(value)),
                Ok(None) => None,
                Err(e) => Some(Err(TransportError::Remote(e))),
            };
            if let Some(reply) = reply {
                let sender = pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&correlation_id);
                if let Some(sender) = sender {
                    let _ = sender.send(reply);
                }
            }
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout {
                destination: destination.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn respond(&self, correlation_id: &str, payload: serde_json::Value) -> Result<(), TransportError> {
        self.complete(correlation_id, Ok(payload))
    }

    async fn register_rpc_method(&self, name: &str, handler: Arc<dyn RpcHandler>) -> Result<(), TransportError> {
        self.rpc_methods.write().await.insert(name.to_string(), handler);
        Ok(())
    }

    async fn call_rpc(
        &self,
        endpoint: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let name = rpc_name(endpoint, method);
        let handler = self
            .rpc_methods
            .read()
            .await
            .get(&name)
            .cloned()
            .ok_or_else(|| TransportError::UnknownMethod(name.clone()))?;
        handler.call(params).await.map_err(TransportError::Remote)
    }
}
