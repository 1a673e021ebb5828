//! Last-Write-Wins 寄存器
//!
//! 比较顺序：时间戳大者胜；时间戳相同按写入方 ID 字典序大者胜；
//! 两者都相同时按值的 JSON 序列化字典序大者胜（所有副本结果一致）。

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// LWW 寄存器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    pub value: T,
    /// 写入时间戳（毫秒，写入方保证单调递增）
    pub timestamp: u64,
    pub writer: String,
}

impl<T: Clone + PartialEq + Serialize> LwwRegister<T> {
    pub fn new(value: T, timestamp: u64, writer: impl Into<String>) -> Self {
        Self {
            value,
            timestamp,
            writer: writer.into(),
        }
    }

    /// 本地写入：只有新写入的 (timestamp, writer) 更大时才生效
    pub fn set(&mut self, value: T, timestamp: u64, writer: impl Into<String>) {
        let candidate = Self::new(value, timestamp, writer);
        if candidate.wins_over(self) {
            *self = candidate;
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// (timestamp, writer, 序列化值) 严格大于对方
    fn wins_over(&self, other: &Self) -> bool {
        match (self.timestamp, &self.writer).cmp(&(other.timestamp, &other.writer)) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal if self.value == other.value => false,
            Ordering::Equal => encoded(&self.value) > encoded(&other.value),
        }
    }

    pub fn merge(&self, other: &Self) -> Self {
        if other.wins_over(self) {
            other.clone()
        } else {
            self.clone()
        }
    }
}

fn encoded<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
