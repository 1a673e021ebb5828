//! 通过消息传输维护组件成员关系
//!
//! | 主题 | 载荷 |
//! |------|------|
//! | `hive.components.register` | `ComponentManifest` |
//! | `hive.components.heartbeat` | `{ "id": .., "health": HealthSnapshot? }` |
//! | `hive.components.deregister` | `{ "id": .. }` |

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::routing::{ComponentManifest, ComponentRegistry, HealthSnapshot};
use crate::transport::{Envelope, MessageHandler, MessageTransport, SubscriptionId, TransportError};

pub const REGISTER_TOPIC: &str = "hive.components.register";
pub const HEARTBEAT_TOPIC: &str = "hive.components.heartbeat";
pub const DEREGISTER_TOPIC: &str = "hive.components.deregister";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub id: String,
    #[serde(default)]
    pub health: Option<HealthSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Departure {
    id: String,
}

/// 订阅成员主题并写入注册表
pub struct MembershipListener {
    registry: Arc<ComponentRegistry>,
}

impl MembershipListener {
    pub fn new(registry: Arc<ComponentRegistry>) -> Self {
        Self { registry }
    }

    pub async fn start(self, transport: &dyn MessageTransport) -> Result<SubscriptionId, TransportError> {
        transport.subscribe("hive.components.*", Arc::new(self)).await
    }

    async fn apply(&self, envelope: Envelope) -> Result<(), serde_json::Error> {
        match envelope.topic.as_str() {
            REGISTER_TOPIC => {
                let manifest: ComponentManifest = serde_json::from_value(envelope.payload)?;
                self.registry.register(manifest).await;
            }
            HEARTBEAT_TOPIC => {
                let beat: Heartbeat = serde_json::from_value(envelope.payload)?;
                if !self.registry.heartbeat(&beat.id, beat.health).await {
                    tracing::debug!(component = %beat.id, "Heartbeat from unregistered component");
                }
            }
            DEREGISTER_TOPIC => {
                let departure: Departure = serde_json::from_value(envelope.payload)?;
                self.registry.deregister(&departure.id).await;
            }
            other => tracing::debug!(topic = other, "Ignoring membership message"),
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for MembershipListener {
    async fn handle(&self, envelope: Envelope) {
        let topic = envelope.topic.clone();
        if let Err(e) = self.apply(envelope).await {
            tracing::warn!(topic = %topic, "Malformed membership message: {}", e);
        }
    }
}

/// 组件侧：发布注册清单
pub async fn announce(transport: &dyn MessageTransport, manifest: &ComponentManifest) -> Result<(), TransportError> {
    let payload = serde_json::to_value(manifest).map_err(|e| TransportError::Remote(e.to_string()))?;
    transport.publish(REGISTER_TOPIC, payload).await
}

/// 组件侧：发布心跳
pub async fn send_heartbeat(
    transport: &dyn MessageTransport,
    id: &str,
    health: Option<HealthSnapshot>,
) -> Result<(), TransportError> {
    let payload = json!({ "id": id, "health": health });
    transport.publish(HEARTBEAT_TOPIC, payload).await
}

/// 组件侧：发布注销
pub async fn depart(transport: &dyn MessageTransport, id: &str) -> Result<(), TransportError> {
    transport.publish(DEREGISTER_TOPIC, json!({ "id": id })).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::HealthStatus;
    use crate::transport::InMemoryTransport;
    use std::time::Duration;

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..50 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_register_heartbeat_deregister() {
        let transport = InMemoryTransport::new();
        let registry = Arc::new(ComponentRegistry::new(Duration::from_secs(30)));
        MembershipListener::new(Arc::clone(&registry))
            .start(&transport)
            .await
            .unwrap();

        let manifest = ComponentManifest::new("db-agent").domains(["database"]);
        announce(&transport, &manifest).await.unwrap();
        eventually(|| async { registry.get("db-agent").await.is_some() }).await;

        let mut degraded = HealthSnapshot::default();
        degraded.status = HealthStatus::Degraded;
        send_heartbeat(&transport, "db-agent", Some(degraded)).await.unwrap();
        eventually(|| async {
            registry
                .get("db-agent")
                .await
                .is_some_and(|r| r.health.status == HealthStatus::Degraded)
        })
        .await;

        depart(&transport, "db-agent").await.unwrap();
        eventually(|| async { registry.is_empty().await }).await;
    }

    #[tokio::test]
    async fn test_malformed_message_is_ignored() {
        let transport = InMemoryTransport::new();
        let registry = Arc::new(ComponentRegistry::new(Duration::from_secs(30)));
        MembershipListener::new(Arc::clone(&registry))
            .start(&transport)
            .await
            .unwrap();

        transport.publish(REGISTER_TOPIC, json!({"nope": true})).await.unwrap();
        announce(&transport, &ComponentManifest::new("ok")).await.unwrap();
        eventually(|| async { registry.len().await == 1 }).await;
    }
}
