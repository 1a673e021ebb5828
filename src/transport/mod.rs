//! 消息传输边界
//!
//! 编排内核只依赖 `MessageTransport` 提供的原语：发布/订阅、基于 correlation id 的
//! 请求/应答、RPC 方法注册与调用。真实的线协议由外部实现；`InMemoryTransport`
//! 是进程内实现，供测试与演示使用。

mod memory;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::InMemoryTransport;

/// 订阅句柄
pub type SubscriptionId = u64;

/// 传输层投递的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// 主题（发布/订阅）或目的地（请求/应答）
    pub topic: String,
    /// 请求/应答关联 ID；纯发布消息为 None
    pub correlation_id: Option<String>,
    pub payload: serde_json::Value,
    /// 发送时间（毫秒时间戳）
    pub sent_at: i64,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            correlation_id: None,
            payload,
            sent_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No responder for destination: {0}")]
    NoRoute(String),
    #[error("Request to {destination} timed out after {timeout_ms}ms")]
    Timeout { destination: String, timeout_ms: u64 },
    #[error("Remote error: {0}")]
    Remote(String),
    #[error("Unknown correlation id: {0}")]
    UnknownCorrelation(String),
    #[error("Unknown RPC method: {0}")]
    UnknownMethod(String),
    #[error("Invalid topic pattern: {0}")]
    InvalidPattern(String),
    #[error("Transport closed")]
    Closed,
}

/// 订阅消息处理器
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope);
}

/// 请求处理器：返回 Some 时由传输层自动应答；返回 None 表示处理器稍后自行调用 `respond`
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<Option<serde_json::Value>, String>;
}

/// RPC 方法处理器
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn call(&self, params: serde_json::Value) -> Result<serde_json::Value, String>;
}

/// 传输原语
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), TransportError>;

    /// 订阅匹配 `topic_pattern`（glob 语法，如 `hive.state.*`）的主题
    async fn subscribe(
        &self,
        topic_pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId, TransportError>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError>;

    /// 发送请求并等待应答（超时返回 `TransportError::Timeout`）
    async fn request(
        &self,
        destination: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError>;

    async fn respond(&self, correlation_id: &str, payload: serde_json::Value) -> Result<(), TransportError>;

    /// 注册 RPC 方法，`name` 为完整名称 `<endpoint>.<method>`
    async fn register_rpc_method(&self, name: &str, handler: Arc<dyn RpcHandler>) -> Result<(), TransportError>;

    async fn call_rpc(
        &self,
        endpoint: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError>;
}

/// RPC 完整方法名
pub fn rpc_name(endpoint: &str, method: &str) -> String {
    format!("{endpoint}.{method}")
}

// ============================================================================
// 闭包适配器
// ============================================================================

/// 把异步闭包包装成处理器
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, envelope: Envelope) {
        (self.0)(envelope).await
    }
}

/// 把 `Fn(Envelope) -> Result<Value, String>` 包装成自动应答的请求处理器
pub struct FnResponder<F>(pub F);

#[async_trait]
impl<F, Fut> RequestHandler for FnResponder<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, String>> + Send,
{
    async fn handle(&self, envelope: Envelope) -> Result<Option<serde_json::Value>, String> {
        (self.0)(envelope).await.map(Some)
    }
}

pub struct FnRpc<F>(pub F);

#[async_trait]
impl<F, Fut> RpcHandler for FnRpc<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, String>> + Send,
{
    async fn call(&self, params: serde_json::Value) -> Result<serde_json::Value, String> {
        (self.0)(params).await
    }
}
