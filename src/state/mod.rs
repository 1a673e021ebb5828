//! 共享状态：CRDT 键值存储与实例间同步

pub mod store;
pub mod sync;

pub use store::{CrdtKind, CrdtValue, StateDelta, StateError, StateStore};
pub use sync::{state_topic, StateSync, SyncError};
