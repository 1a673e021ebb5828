//! CRDT 原语：LWW 寄存器、增长计数器、观察-删除集合
//!
//! 三种类型都只暴露纯函数 `merge(&self, &other) -> Self`，满足交换律、结合律与幂等性；
//! 可变的包装（按 key 串行化）在 `state::StateStore` 中实现。

pub mod gcounter;
pub mod lww;
pub mod orset;

pub use gcounter::GCounter;
pub use lww::LwwRegister;
pub use orset::{OrSet, Tag};

/// 可合并的值类型
pub trait Mergeable: Sized {
    /// 合并两个副本，返回新值（不修改任一输入）
    fn merge(&self, other: &Self) -> Self;

    /// 原地合并：`self = merge(self, other)`
    fn merge_in(&mut self, other: &Self) {
        *self = self.merge(other);
    }
}

impl<T: Clone + PartialEq + serde::Serialize> Mergeable for LwwRegister<T> {
    fn merge(&self, other: &Self) -> Self {
        LwwRegister::merge(self, other)
    }
}

impl Mergeable for GCounter {
    fn merge(&self, other: &Self) -> Self {
        GCounter::merge(self, other)
    }
}

impl<T: Ord + Clone> Mergeable for OrSet<T> {
    fn merge(&self, other: &Self) -> Self {
        OrSet::merge(self, other)
    }
}
