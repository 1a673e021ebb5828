//! 工作流：链定义、依赖图、构建器、由路由决策生成的执行计划与执行引擎

pub mod builder;
pub mod engine;
pub mod graph;
pub mod plan;
pub mod types;

pub use builder::WorkflowBuilder;
pub use engine::{WorkflowConfig, WorkflowEngine};
pub use graph::{DependencyGraph, TopologicalOrder};
pub use plan::plan_from_decision;
pub use types::*;
