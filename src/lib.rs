//! Hive - 组件编排内核
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排实例、构建器、成员与健康维护、路由历史、优雅关闭
//! - **crdt**: LWW 寄存器、增长计数器、OR-Set 及其合并
//! - **observability**: 日志初始化
//! - **resilience**: 熔断器、重试、降级链与组合调用入口
//! - **routing**: 能力词表、组件注册表、请求分类、能力匹配、路由决策
//! - **state**: 基于 CRDT 的共享状态存储与实例间同步
//! - **transport**: 消息传输边界与进程内实现
//! - **workflow**: 链定义、依赖图、执行计划与工作流引擎

pub mod config;
pub mod core;
pub mod crdt;
pub mod observability;
pub mod resilience;
pub mod routing;
pub mod state;
pub mod transport;
pub mod workflow;

pub use crate::core::{Orchestrator, OrchestratorBuilder, OrchestratorError};
