//! 组件注册表
//!
//! 由单个编排实例持有（不做全局单例）。记录按注册顺序编号，
//! 匹配器用该序号打破同分。

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::capability::{CapabilitySet, ComponentManifest, HealthSnapshot, HealthStatus, RoutingMetadata};

#[derive(Debug, Clone, Serialize)]
pub struct ComponentRecord {
    pub id: String,
    pub capabilities: CapabilitySet,
    pub routing: RoutingMetadata,
    pub health: HealthSnapshot,
    pub last_heartbeat: DateTime<Utc>,
    /// 注册序号（重复注册保持不变）
    pub sequence: u64,
}

impl ComponentRecord {
    pub fn is_down(&self) -> bool {
        self.health.status == HealthStatus::Down
    }

    pub fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        now.signed_duration_since(self.last_heartbeat) > timeout
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read manifest file {path}: {message}")]
    Io { path: String, message: String },

    #[error("Invalid manifest file {path}: {message}")]
    Parse { path: String, message: String },
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    components: Vec<ComponentManifest>,
}

/// 组件注册表
pub struct ComponentRegistry {
    components: RwLock<HashMap<String, ComponentRecord>>,
    next_sequence: AtomicU64,
    heartbeat_timeout: Duration,
}

impl ComponentRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            next_sequence: AtomicU64::new(0),
            heartbeat_timeout,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// 注册或更新组件；返回是否为新组件
    pub async fn register(&self, manifest: ComponentManifest) -> bool {
        let mut components = self.components.write().await;
        let now = Utc::now();
        match components.get_mut(&manifest.id) {
            Some(existing) => {
                existing.capabilities = manifest.capabilities;
                existing.routing = manifest.routing;
                existing.last_heartbeat = now;
                tracing::debug!(component = %existing.id, "Component manifest updated");
                false
            }
            None => {
                let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
                tracing::info!(component = %manifest.id, sequence, "Component registered");
                components.insert(
                    manifest.id.clone(),
                    ComponentRecord {
                        id: manifest.id,
                        capabilities: manifest.capabilities,
                        routing: manifest.routing,
                        health: HealthSnapshot::default(),
                        last_heartbeat: now,
                        sequence,
                    },
                );
                true
            }
        }
    }

    /// 心跳；可携带健康快照。未注册组件返回 false
    pub async fn heartbeat(&self, id: &str, health: Option<HealthSnapshot>) -> bool {
        let mut components = self.components.write().await;
        let Some(record) = components.get_mut(id) else {
            return false;
        };
        record.last_heartbeat = Utc::now();
        if let Some(health) = health {
            record.health = health;
        }
        true
    }

    pub async fn update_health(&self, id: &str, health: HealthSnapshot) -> bool {
        let mut components = self.components.write().await;
        match components.get_mut(id) {
            Some(record) => {
                if record.health.status != health.status {
                    tracing::info!(component = id, status = ?health.status, "Component health changed");
                }
                record.health = health;
                true
            }
            None => false,
        }
    }

    pub async fn deregister(&self, id: &str) -> Option<ComponentRecord> {
        let removed = self.components.write().await.remove(id);
        if removed.is_some() {
            tracing::info!(component = id, "Component deregistered");
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<ComponentRecord> {
        self.components.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.components.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.components.read().await.is_empty()
    }

    /// 按注册顺序返回全部组件
    pub async fn snapshot(&self) -> Vec<ComponentRecord> {
        let mut records: Vec<ComponentRecord> = self.components.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.sequence);
        records
    }

    /// 移除心跳超时的组件，返回被移除的 ID
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut components = self.components.write().await;
        let expired: Vec<String> = components
            .values()
            .filter(|r| r.is_expired(now, self.heartbeat_timeout))
            .map(|r| r.id.clone())
            .collect();
        for id in &expired {
            components.remove(id);
            tracing::warn!(component = %id, "Component heartbeat expired, removed");
        }
        expired
    }

    /// 从 TOML 文件加载静态清单（`[[components]]` 数组）
    pub async fn load_manifests(&self, path: impl AsRef<Path>) -> Result<usize, RegistryError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| RegistryError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let file: ManifestFile = toml::from_str(&content).map_err(|e| RegistryError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let count = file.components.len();
        for manifest in file.components {
            self.register(manifest).await;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::capability::Domain;
    use std::io::Write;

    #[tokio::test]
    async fn test_register_preserves_sequence_on_update() {
        let registry = ComponentRegistry::new(Duration::from_secs(30));
        assert!(registry.register(ComponentManifest::new("a")).await);
        assert!(registry.register(ComponentManifest::new("b")).await);
        assert!(!registry.register(ComponentManifest::new("a").priority(150)).await);

        let ids: Vec<_> = registry.snapshot().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(registry.get("a").await.unwrap().routing.priority, 150);
    }

    #[tokio::test]
    async fn test_heartbeat_and_health() {
        let registry = ComponentRegistry::new(Duration::from_secs(30));
        registry.register(ComponentManifest::new("a")).await;
        assert!(registry.heartbeat("a", Some(HealthSnapshot::down())).await);
        assert!(registry.get("a").await.unwrap().is_down());
        assert!(!registry.heartbeat("ghost", None).await);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let registry = ComponentRegistry::new(Duration::from_secs(10));
        registry.register(ComponentManifest::new("old")).await;
        registry.register(ComponentManifest::new("fresh")).await;

        let later = Utc::now() + chrono::Duration::seconds(11);
        registry.heartbeat("fresh", None).await;
        {
            let mut components = registry.components.write().await;
            if let Some(fresh) = components.get_mut("fresh") {
                fresh.last_heartbeat = later;
            }
        }

        let removed = registry.sweep_expired(later).await;
        assert_eq!(removed, vec!["old".to_string()]);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_load_manifests_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[components]]
id = "db-agent"
[components.capabilities]
domains = ["database"]
[components.routing]
priority = 110

[[components]]
id = "web-agent"
"#
        )
        .unwrap();

        let registry = ComponentRegistry::new(Duration::from_secs(30));
        assert_eq!(registry.load_manifests(file.path()).await.unwrap(), 2);
        let db = registry.get("db-agent").await.unwrap();
        assert!(db.capabilities.covers(&Domain::Database));
        assert_eq!(db.routing.priority, 110);
    }
}
