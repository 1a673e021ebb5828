//! 分布式状态存储
//!
//! 每个编排器实例持有一个 StateStore：key -> CRDT 值。
//! - 同一 key 的读写通过该 key 独占的 Mutex 串行化；不同 key 可并发。
//! - 每次本地修改后，把该 key 的完整 CRDT 快照作为 `StateDelta` 广播出去（供 StateSync 导出）。
//! - 远端更新只能经由 `merge_changes` 合并，绝不直接覆盖。

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::crdt::{GCounter, LwwRegister, OrSet, Tag};

/// CRDT 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrdtKind {
    Register,
    Counter,
    Set,
}

impl std::fmt::Display for CrdtKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrdtKind::Register => write!(f, "register"),
            CrdtKind::Counter => write!(f, "counter"),
            CrdtKind::Set => write!(f, "set"),
        }
    }
}

/// 存储中的值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum CrdtValue {
    Register(LwwRegister<serde_json::Value>),
    Counter(GCounter),
    Set(OrSet<String>),
}

impl CrdtValue {
    pub fn kind(&self) -> CrdtKind {
        match self {
            CrdtValue::Register(_) => CrdtKind::Register,
            CrdtValue::Counter(_) => CrdtKind::Counter,
            CrdtValue::Set(_) => CrdtKind::Set,
        }
    }
}

/// 一次可导出的状态变更（key 的完整快照）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    /// 产生该快照的副本
    pub origin: String,
    pub key: String,
    pub value: CrdtValue,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Key '{key}' holds a {actual}, not a {expected}")]
    KindMismatch {
        key: String,
        expected: CrdtKind,
        actual: CrdtKind,
    },
}

/// 广播缓冲（订阅方落后太多会收到 Lagged，之后可用 snapshot 补齐）
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

type Slot = Arc<Mutex<CrdtValue>>;

pub struct StateStore {
    replica_id: String,
    entries: RwLock<HashMap<String, Slot>>,
    /// 最近一次发出的时间戳（毫秒），保证本副本写入严格递增
    clock: AtomicU64,
    tag_seq: AtomicU64,
    changes: broadcast::Sender<StateDelta>,
}

impl StateStore {
    pub fn new(replica_id: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            replica_id: replica_id.into(),
            entries: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            tag_seq: AtomicU64::new(0),
            changes,
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    /// 订阅本地修改（导出通道）
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateDelta> {
        self.changes.subscribe()
    }

    // ---- Register ----

    pub fn set_register(&self, key: &str, value: serde_json::Value) -> Result<(), StateError> {
        let ts = self.next_timestamp();
        let replica = self.replica_id.clone();
        self.mutate(
            key,
            CrdtKind::Register,
            || CrdtValue::Register(LwwRegister::new(serde_json::Value::Null, 0, "")),
            |v| {
                if let CrdtValue::Register(reg) = v {
                    reg.set(value, ts, replica);
                }
            },
        )
    }

    pub fn get_register(&self, key: &str) -> Result<Option<serde_json::Value>, StateError> {
        self.read(key, CrdtKind::Register, |v| match v {
            CrdtValue::Register(reg) => Some(reg.get().clone()),
            _ => None,
        })
        .map(Option::flatten)
    }

    // ---- Counter ----

    pub fn increment_counter(&self, key: &str, by: u64) -> Result<u64, StateError> {
        let replica = self.replica_id.clone();
        let mut total = 0;
        self.mutate(
            key,
            CrdtKind::Counter,
            || CrdtValue::Counter(GCounter::new()),
            |v| {
                if let CrdtValue::Counter(counter) = v {
                    counter.increment(&replica, by);
                    total = counter.value();
                }
            },
        )?;
        Ok(total)
    }

    /// 不存在的计数器视为 0
    pub fn get_counter(&self, key: &str) -> Result<u64, StateError> {
        self.read(key, CrdtKind::Counter, |v| match v {
            CrdtValue::Counter(counter) => counter.value(),
            _ => 0,
        })
        .map(|v| v.unwrap_or(0))
    }

    // ---- Set ----

    pub fn add_to_set(&self, key: &str, element: &str) -> Result<(), StateError> {
        let tag = Tag::new(self.replica_id.clone(), self.tag_seq.fetch_add(1, Ordering::Relaxed) + 1);
        self.mutate(
            key,
            CrdtKind::Set,
            || CrdtValue::Set(OrSet::new()),
            |v| {
                if let CrdtValue::Set(set) = v {
                    set.add(element.to_string(), tag);
                }
            },
        )
    }

    /// 删除本副本已观察到的该元素所有 tag；返回是否删除了任何东西
    pub fn remove_from_set(&self, key: &str, element: &str) -> Result<bool, StateError> {
        let mut removed = false;
        self.mutate(
            key,
            CrdtKind::Set,
            || CrdtValue::Set(OrSet::new()),
            |v| {
                if let CrdtValue::Set(set) = v {
                    removed = !set.remove(&element.to_string()).is_empty();
                }
            },
        )?;
        Ok(removed)
    }

    pub fn get_set(&self, key: &str) -> Result<BTreeSet<String>, StateError> {
        self.read(key, CrdtKind::Set, |v| match v {
            CrdtValue::Set(set) => set.elements(),
            _ => BTreeSet::new(),
        })
        .map(Option::unwrap_or_default)
    }

    // ---- 远端合并 ----

    /// 合并远端值。key 不存在时直接采用远端值；类型不符返回 KindMismatch。
    /// 合并结果不进入导出通道（远端更新由其来源副本负责导出）。
    pub fn merge_changes(&self, kind: CrdtKind, key: &str, remote: CrdtValue) -> Result<(), StateError> {
        if remote.kind() != kind {
            return Err(StateError::KindMismatch {
                key: key.to_string(),
                expected: kind,
                actual: remote.kind(),
            });
        }
        if let CrdtValue::Register(reg) = &remote {
            self.observe_timestamp(reg.timestamp);
        }
        if let CrdtValue::Set(set) = &remote {
            self.observe_tags(set);
        }

        let slot = self.slot(key, || remote.clone());
        let mut current = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let merged = match (&*current, &remote) {
            (CrdtValue::Register(a), CrdtValue::Register(b)) => CrdtValue::Register(a.merge(b)),
            (CrdtValue::Counter(a), CrdtValue::Counter(b)) => CrdtValue::Counter(a.merge(b)),
            (CrdtValue::Set(a), CrdtValue::Set(b)) => CrdtValue::Set(a.merge(b)),
            (local, _) => {
                return Err(StateError::KindMismatch {
                    key: key.to_string(),
                    expected: local.kind(),
                    actual: remote.kind(),
                })
            }
        };
        if merged != *current {
            *current = merged;
            tracing::debug!(key, kind = %kind, "Merged remote state");
        }
        Ok(())
    }

    /// 读取某个 key 的完整 CRDT 值（用于 importState 应答）
    pub fn export_value(&self, key: &str) -> Option<CrdtValue> {
        let slot = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()?;
        let value = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Some(value)
    }

    /// 全量快照
    pub fn snapshot(&self) -> Vec<StateDelta> {
        let slots: Vec<(String, Slot)> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        let mut out: Vec<StateDelta> = slots
            .into_iter()
            .map(|(key, slot)| StateDelta {
                origin: self.replica_id.clone(),
                value: slot.lock().unwrap_or_else(PoisonError::into_inner).clone(),
                key,
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    // ---- 内部 ----

    fn slot(&self, key: &str, init: impl FnOnce() -> CrdtValue) -> Slot {
        if let Some(slot) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(slot);
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(init()))),
        )
    }

    fn mutate(
        &self,
        key: &str,
        kind: CrdtKind,
        init: impl FnOnce() -> CrdtValue,
        apply: impl FnOnce(&mut CrdtValue),
    ) -> Result<(), StateError> {
        let slot = self.slot(key, init);
        let mut value = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if value.kind() != kind {
            return Err(StateError::KindMismatch {
                key: key.to_string(),
                expected: kind,
                actual: value.kind(),
            });
        }
        apply(&mut value);
        let snapshot = value.clone();
        drop(value);
        self.emit(key, snapshot);
        Ok(())
    }

    fn read<R>(&self, key: &str, kind: CrdtKind, f: impl FnOnce(&CrdtValue) -> R) -> Result<Option<R>, StateError> {
        let Some(slot) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
        else {
            return Ok(None);
        };
        let value = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if value.kind() != kind {
            return Err(StateError::KindMismatch {
                key: key.to_string(),
                expected: kind,
                actual: value.kind(),
            });
        }
        Ok(Some(f(&value)))
    }

    fn emit(&self, key: &str, value: CrdtValue) {
        // 没有订阅者时 send 返回 Err，属正常情况
        let _ = self.changes.send(StateDelta {
            origin: self.replica_id.clone(),
            key: key.to_string(),
            value,
        });
    }

    fn next_timestamp(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut last = self.clock.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .clock
                .compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// 远端时间戳更大时推进本地时钟，避免本地后续写入被时钟偏差吞掉
    fn observe_timestamp(&self, ts: u64) {
        self.clock.fetch_max(ts, Ordering::SeqCst);
    }

    /// 同一副本 ID 重启后不复用已发出的 tag 序号（含已删除的 tag）
    fn observe_tags(&self, set: &OrSet<String>) {
        let max_seq = set
            .elements()
            .iter()
            .flat_map(|e| set.tags_of(e))
            .chain(set.tombstones().iter().cloned())
            .filter(|t| t.replica == self.replica_id)
            .map(|t| t.seq)
            .max();
        if let Some(seq) = max_seq {
            self.tag_seq.fetch_max(seq, Ordering::SeqCst);
        }
    }
}
