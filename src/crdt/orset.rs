//! 观察-删除集合（OR-Set）
//!
//! 每次 add 生成唯一 tag；remove 只删除本副本当前观察到的 tag，并把它们记入墓碑。
//! 合并 = 两侧 add 的并集减去两侧墓碑的并集，因此并发的 add（删除方未观察到的 tag）会保留。

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// add 操作的唯一标识：写入方 + 写入方内序号
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub replica: String,
    pub seq: u64,
}

impl Tag {
    pub fn new(replica: impl Into<String>, seq: u64) -> Self {
        Self {
            replica: replica.into(),
            seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrSet<T: Ord> {
    /// 元素 -> 仍存活的 add tag
    entries: BTreeMap<T, BTreeSet<Tag>>,
    /// 已被删除（观察后删除）的 tag
    tombstones: BTreeSet<Tag>,
}

impl<T: Ord> Default for OrSet<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            tombstones: BTreeSet::new(),
        }
    }
}

impl<T: Ord + Clone> OrSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以给定 tag 添加元素；tag 已被删除过则忽略
    pub fn add(&mut self, element: T, tag: Tag) {
        if self.tombstones.contains(&tag) {
            return;
        }
        self.entries.entry(element).or_default().insert(tag);
    }

    /// 删除元素当前观察到的全部 tag，返回被删除的 tag
    pub fn remove(&mut self, element: &T) -> BTreeSet<Tag> {
        match self.entries.remove(element) {
            Some(tags) => {
                self.tombstones.extend(tags.iter().cloned());
                tags
            }
            None => BTreeSet::new(),
        }
    }

    pub fn contains(&self, element: &T) -> bool {
        self.entries.get(element).is_some_and(|tags| !tags.is_empty())
    }

    pub fn elements(&self) -> BTreeSet<T> {
        self.entries
            .iter()
            .filter(|(_, tags)| !tags.is_empty())
            .map(|(e, _)| e.clone())
            .collect()
    }

    pub fn tags_of(&self, element: &T) -> BTreeSet<Tag> {
        self.entries.get(element).cloned().unwrap_or_default()
    }

    /// 已删除的 tag
    pub fn tombstones(&self) -> &BTreeSet<Tag> {
        &self.tombstones
    }

    pub fn len(&self) -> usize {
        self.entries.values().filter(|tags| !tags.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn merge(&self, other: &Self) -> Self {
        let tombstones: BTreeSet<Tag> = self.tombstones.union(&other.tombstones).cloned().collect();

        let mut entries: BTreeMap<T, BTreeSet<Tag>> = BTreeMap::new();
        for (element, tags) in self.entries.iter().chain(other.entries.iter()) {
            let live = tags.iter().filter(|t| !tombstones.contains(*t)).cloned();
            entries.entry(element.clone()).or_default().extend(live);
        }
        entries.retain(|_, tags| !tags.is_empty());

        Self { entries, tombstones }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_remove() {
        let mut set = OrSet::new();
        set.add("a".to_string(), Tag::new("r1", 1));
        assert!(set.contains(&"a".to_string()));
        let removed = set.remove(&"a".to_string());
        assert_eq!(removed.len(), 1);
        assert!(!set.contains(&"a".to_string()));
        assert!(set.tombstones().contains(&Tag::new("r1", 1)));
    }

    #[test]
    fn test_unobserved_add_survives_remove() {
        // 副本 A 添加 "a"，副本 B 从未观察到该 tag 就执行删除
        let mut a = OrSet::new();
        a.add("a".to_string(), Tag::new("A", 1));

        let mut b: OrSet<String> = OrSet::new();
        b.remove(&"a".to_string());

        let merged = a.merge(&b);
        assert!(merged.contains(&"a".to_string()));
        assert_eq!(merged.tags_of(&"a".to_string()).len(), 1);
        assert_eq!(merged, b.merge(&a));
    }

    #[test]
    fn test_observed_remove_propagates() {
        let mut a = OrSet::new();
        a.add("a".to_string(), Tag::new("A", 1));
        let mut b = a.clone();
        b.remove(&"a".to_string());

        let merged = a.merge(&b);
        assert!(!merged.contains(&"a".to_string()));
    }

    #[test]
    fn test_concurrent_add_wins() {
        let mut a = OrSet::new();
        a.add("x".to_string(), Tag::new("A", 1));
        let mut b = a.clone();
        b.remove(&"x".to_string());
        a.add("x".to_string(), Tag::new("A", 2));

        let merged = a.merge(&b);
        assert!(merged.contains(&"x".to_string()));
        assert_eq!(merged.tags_of(&"x".to_string()), BTreeSet::from([Tag::new("A", 2)]));
    }

    #[test]
    fn test_re_add_of_tombstoned_tag_ignored() {
        let mut set = OrSet::new();
        set.add(1u32, Tag::new("A", 1));
        set.remove(&1);
        set.add(1, Tag::new("A", 1));
        assert!(!set.contains(&1));
    }
}
