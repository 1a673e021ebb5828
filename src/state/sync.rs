//! 实例间状态同步（exportState / importState）
//!
//! - 导出：把 StateStore 的本地修改发布到 `hive.state.<replica>`；订阅落后时改发全量快照。
//! - 接收：订阅 `hive.state.*`，忽略自身来源，其余一律经 `merge_changes` 合并。
//! - 拉取：RPC `<replica>.state.import` 按 key 返回当前 CRDT 值。
//!
//! 不承诺顺序与送达时效，只保证「最终送达、按合并应用」。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use super::store::{CrdtValue, StateDelta, StateError, StateStore};
use crate::transport::{
    Envelope, MessageHandler, MessageTransport, RpcHandler, SubscriptionId, TransportError,
};

pub const STATE_TOPIC_PREFIX: &str = "hive.state";
pub const IMPORT_METHOD: &str = "state.import";
const DEFAULT_IMPORT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("Malformed state payload: {0}")]
    Decode(String),
}

pub fn state_topic(replica: &str) -> String {
    format!("{STATE_TOPIC_PREFIX}.{replica}")
}

pub struct StateSync {
    store: Arc<StateStore>,
    transport: Arc<dyn MessageTransport>,
    /// importState 的 RPC 截止时间
    timeout: Duration,
}

impl StateSync {
    pub fn new(store: Arc<StateStore>, transport: Arc<dyn MessageTransport>) -> Self {
        Self {
            store,
            transport,
            timeout: DEFAULT_IMPORT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 启动同步：注册 import RPC、订阅远端变更、启动导出泵；返回订阅 ID
    pub async fn start(&self, cancel: CancellationToken) -> Result<SubscriptionId, SyncError> {
        let replica = self.store.replica_id().to_string();

        self.transport
            .register_rpc_method(
                &format!("{replica}.{IMPORT_METHOD}"),
                Arc::new(ImportResponder {
                    store: Arc::clone(&self.store),
                }),
            )
            .await?;

        let subscription = self
            .transport
            .subscribe(
                &format!("{STATE_TOPIC_PREFIX}.*"),
                Arc::new(DeltaApplier {
                    store: Arc::clone(&self.store),
                }),
            )
            .await?;

        let mut changes = self.store.subscribe_changes();
        let store = Arc::clone(&self.store);
        let transport = Arc::clone(&self.transport);
        let topic = state_topic(&replica);
        tokio::spawn(async move {
            loop {
                let deltas = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = changes.recv() => match received {
                        Ok(delta) => vec![delta],
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "State export lagged, publishing full snapshot");
                            store.snapshot()
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                for delta in deltas {
                    if let Err(e) = publish_delta(transport.as_ref(), &topic, &delta).await {
                        tracing::warn!(key = %delta.key, "State export failed: {}", e);
                    }
                }
            }
            tracing::debug!("State export pump stopped");
        });

        tracing::info!(replica = %replica, "State sync started");
        Ok(subscription)
    }

    /// 主动导出一个 key（exportState）
    pub async fn export_state(&self, key: &str, value: CrdtValue) -> Result<(), SyncError> {
        let delta = StateDelta {
            origin: self.store.replica_id().to_string(),
            key: key.to_string(),
            value,
        };
        publish_delta(self.transport.as_ref(), &state_topic(self.store.replica_id()), &delta).await?;
        Ok(())
    }

    /// 从 owner 拉取 key 并合并进本地（importState）；owner 没有该 key 时返回 None
    pub async fn import_state(&self, owner_id: &str, key: &str) -> Result<Option<CrdtValue>, SyncError> {
        let call = self.transport.call_rpc(owner_id, IMPORT_METHOD, json!({ "key": key }));
        let reply = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| TransportError::Timeout {
                destination: format!("{owner_id}.{IMPORT_METHOD}"),
                timeout_ms: self.timeout.as_millis() as u64,
            })??;
        if reply.is_null() {
            return Ok(None);
        }
        let value: CrdtValue =
            serde_json::from_value(reply).map_err(|e| SyncError::Decode(e.to_string()))?;
        self.store.merge_changes(value.kind(), key, value.clone())?;
        Ok(self.store.export_value(key).or(Some(value)))
    }

    /// 发布全量快照（关闭前调用）
    pub async fn flush(&self) -> Result<usize, SyncError> {
        let topic = state_topic(self.store.replica_id());
        let snapshot = self.store.snapshot();
        for delta in &snapshot {
            publish_delta(self.transport.as_ref(), &topic, delta).await?;
        }
        Ok(snapshot.len())
    }
}

async fn publish_delta(
    transport: &dyn MessageTransport,
    topic: &str,
    delta: &StateDelta,
) -> Result<(), TransportError> {
    let payload = serde_json::to_value(delta).map_err(|e| TransportError::Remote(e.to_string()))?;
    transport.publish(topic, payload).await
}

struct DeltaApplier {
    store: Arc<StateStore>,
}

#[async_trait]
impl MessageHandler for DeltaApplier {
    async fn handle(&self, envelope: Envelope) {
        let delta: StateDelta = match serde_json::from_value(envelope.payload) {
            Ok(delta) => delta,
            Err(e) => {
                tracing::warn!(topic = %envelope.topic, "Dropping malformed state delta: {}", e);
                return;
            }
        };
        if delta.origin == self.store.replica_id() {
            return;
        }
        if let Err(e) = self.store.merge_changes(delta.value.kind(), &delta.key, delta.value) {
            tracing::warn!(origin = %delta.origin, "Ignoring remote state: {}", e);
        }
    }
}

struct ImportResponder {
    store: Arc<StateStore>,
}

#[async_trait]
impl RpcHandler for ImportResponder {
    async fn call(&self, params: serde_json::Value) -> Result<serde_json::Value, String> {
        let key = params
            .get("key")
            .and_then(|k| k.as_str())
            .ok_or_else(|| "missing 'key'".to_string())?;
        match self.store.export_value(key) {
            Some(value) => serde_json::to_value(value).map_err(|e| e.to_string()),
            None => Ok(serde_json::Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FnRpc, InMemoryTransport};

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_local_changes_reach_peer() {
        let transport: Arc<dyn MessageTransport> = Arc::new(InMemoryTransport::new());
        let a = Arc::new(StateStore::new("a"));
        let b = Arc::new(StateStore::new("b"));
        let cancel = CancellationToken::new();
        StateSync::new(Arc::clone(&a), Arc::clone(&transport)).start(cancel.clone()).await.unwrap();
        StateSync::new(Arc::clone(&b), Arc::clone(&transport)).start(cancel.clone()).await.unwrap();

        a.increment_counter("routes/x", 3).unwrap();
        b.add_to_set("members", "b-only").unwrap();

        assert!(eventually(|| b.get_counter("routes/x").unwrap() == 3).await);
        assert!(eventually(|| a.get_set("members").unwrap().contains("b-only")).await);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_import_state_pulls_and_merges() {
        let transport: Arc<dyn MessageTransport> = Arc::new(InMemoryTransport::new());
        let owner = Arc::new(StateStore::new("owner"));
        let reader = Arc::new(StateStore::new("reader"));
        let cancel = CancellationToken::new();
        StateSync::new(Arc::clone(&owner), Arc::clone(&transport)).start(cancel.clone()).await.unwrap();
        let reader_sync = StateSync::new(Arc::clone(&reader), Arc::clone(&transport));

        owner.set_register("plan/1", json!("running")).unwrap();
        let imported = reader_sync.import_state("owner", "plan/1").await.unwrap();
        assert!(matches!(imported, Some(CrdtValue::Register(_))));
        assert_eq!(reader.get_register("plan/1").unwrap(), Some(json!("running")));

        let missing = reader_sync.import_state("owner", "nope").await.unwrap();
        assert!(missing.is_none());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_import_state_gives_up_on_silent_owner() {
        let transport: Arc<dyn MessageTransport> = Arc::new(InMemoryTransport::new());
        transport
            .register_rpc_method(
                &format!("owner.{IMPORT_METHOD}"),
                Arc::new(FnRpc(|_params: serde_json::Value| async {
                    std::future::pending::<()>().await;
                    Ok(json!(null))
                })),
            )
            .await
            .unwrap();
        let reader = Arc::new(StateStore::new("reader"));
        let sync = StateSync::new(Arc::clone(&reader), transport).with_timeout(Duration::from_millis(50));

        let err = tokio::time::timeout(Duration::from_secs(1), sync.import_state("owner", "k"))
            .await
            .expect("import_state must honour its deadline")
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Transport(TransportError::Timeout { timeout_ms: 50, .. })
        ));
        assert!(reader.keys().is_empty());
    }
}
