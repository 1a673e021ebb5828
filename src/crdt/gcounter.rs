//! 只增计数器（GCounter）

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 每个写入方一个单调递增的计数，值为各写入方计数之和
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GCounter {
    counts: BTreeMap<String, u64>,
}

impl GCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入方自增
    pub fn increment(&mut self, writer: &str, by: u64) {
        let entry = self.counts.entry(writer.to_string()).or_insert(0);
        *entry = entry.saturating_add(by);
    }

    pub fn value(&self) -> u64 {
        self.counts.values().fold(0u64, |acc, c| acc.saturating_add(*c))
    }

    /// 单个写入方的计数
    pub fn count_of(&self, writer: &str) -> u64 {
        self.counts.get(writer).copied().unwrap_or(0)
    }

    pub fn writers(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(String::as_str)
    }

    /// 按写入方取最大值
    pub fn merge(&self, other: &Self) -> Self {
        let mut counts = self.counts.clone();
        for (writer, count) in &other.counts {
            let entry = counts.entry(writer.clone()).or_insert(0);
            *entry = (*entry).max(*count);
        }
        Self { counts }
    }
}
